//! Per-client dispatcher (§4.2): drives one client socket to completion.

mod handlers;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hyperproxy_protocol::ErrorPayload;
use hyperproxy_protocol::frame::{FrameHeader, FrameType};

use crate::config::DaemonConfig;
use crate::error::DaemonResult;
use crate::protocol::{SharedWriter, json_frame, read_frame};
use crate::registry::Registry;
use crate::session::Session;
use crate::vm::Vm;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a command handler, serialized into the single response frame
/// the dispatcher writes per command (§4.2).
pub enum HandlerOutcome {
    Json(serde_json::Value),
    Raw(Vec<u8>),
    Empty,
}

/// Per-client state the dispatcher owns for the life of one socket (§4.2):
/// the attached VM, the claimed token (if this is a shim), and the session
/// that token is bound to.
pub struct ClientState {
    pub client_id: u64,
    pub writer: SharedWriter,
    pub vm: Option<Arc<Vm>>,
    pub session: Option<Arc<Session>>,
    pub claimed_token: Option<String>,
}

/// Drive one accepted client connection until it closes or misbehaves.
pub async fn run_client(stream: tokio::net::UnixStream, registry: Registry, config: Arc<DaemonConfig>) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (mut read_half, write_half) = stream.into_split();
    let writer = SharedWriter::new(write_half);

    let mut state = ClientState {
        client_id,
        writer: writer.clone(),
        vm: None,
        session: None,
        claimed_token: None,
    };

    loop {
        let (header, payload) = match read_frame(&mut read_half, config.max_payload_len).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(client_id, error = %e, "client socket closed");
                break;
            }
        };

        match header.frame_type {
            FrameType::Command => {
                let outcome =
                    handlers::dispatch_command(&mut state, &registry, &config, header.opcode, &payload)
                        .await;
                if let Err(e) = respond(&writer, header.opcode, outcome).await {
                    tracing::warn!(client_id, error = %e, "failed to write response frame");
                    break;
                }
            }
            FrameType::Stream => {
                if let Err(e) =
                    handlers::dispatch_stream(&mut state, &registry, &config, header.opcode, payload).await
                {
                    tracing::warn!(client_id, opcode = header.opcode, error = %e, "stream handler failed, closing socket");
                    break;
                }
            }
            other => {
                tracing::warn!(client_id, frame_type = %other, "unexpected frame type from client, closing");
                break;
            }
        }
    }

    cleanup(&state, &registry);
}

async fn respond(
    writer: &SharedWriter,
    opcode: u8,
    outcome: DaemonResult<HandlerOutcome>,
) -> DaemonResult<()> {
    match outcome {
        Ok(HandlerOutcome::Json(value)) => {
            let (header, payload) = json_frame(FrameType::Response, opcode, &value)?;
            writer.write(&header, &payload).await
        }
        Ok(HandlerOutcome::Raw(bytes)) => {
            let header = FrameHeader::new(FrameType::Response, opcode, bytes.len() as u32);
            writer.write(&header, &bytes).await
        }
        Ok(HandlerOutcome::Empty) => {
            let header = FrameHeader::new(FrameType::Response, opcode, 0);
            writer.write(&header, &[]).await
        }
        Err(e) => {
            let payload = ErrorPayload::new(e.to_string());
            let (header, bytes) = json_frame(FrameType::Response, opcode, &payload)?;
            writer.write(&header.with_error(), &bytes).await
        }
    }
}

/// On socket close: a claimed token is demoted (not freed) and its session
/// detached from this writer (§4.2).
fn cleanup(state: &ClientState, registry: &Registry) {
    if let Some(session) = &state.session {
        session.detach_shim();
    }
    if let Some(token) = &state.claimed_token {
        registry.release_token(token);
    }
}
