//! Agent control-channel transport (§4.3): length-prefixed framing,
//! at-most-one-inflight request/response, READY handshake, and a
//! background reader that demultiplexes replies from pushed frames.

use std::sync::Arc;
use std::time::Duration;

use hyperproxy_protocol::agent_code;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{DaemonError, DaemonResult, timeout_err};

const CONTROL_HEADER_LEN: usize = 8;

async fn read_control_frame(
    reader: &mut OwnedReadHalf,
) -> std::io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; CONTROL_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let total_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let payload_len = total_len.saturating_sub(CONTROL_HEADER_LEN);
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok((code, payload))
}

async fn write_control_frame(
    writer: &mut OwnedWriteHalf,
    code: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let total_len = (CONTROL_HEADER_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(CONTROL_HEADER_LEN + payload.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await
}

enum ControlReply {
    Ack(Vec<u8>),
    Error(String),
}

/// Owns the agent control channel for one VM. At most one command is ever
/// in flight: `send_lock` is held for the whole request/response pair.
pub struct VmControlClient {
    send_lock: Mutex<OwnedWriteHalf>,
    pending: parking_lot::Mutex<Option<oneshot::Sender<ControlReply>>>,
    lost: CancellationToken,
}

impl VmControlClient {
    /// Perform the READY handshake and spawn the background reader task.
    /// `on_push` is invoked for frames that are not a reply to any
    /// in-flight caller (agent-initiated notifications, §4.3).
    pub async fn connect(
        stream: tokio::net::UnixStream,
        ready_timeout: Duration,
        lost: CancellationToken,
        on_push: impl Fn(u32, Vec<u8>) + Send + Sync + 'static,
    ) -> DaemonResult<Arc<Self>> {
        let (mut read_half, write_half) = stream.into_split();

        let (code, _payload) = tokio::time::timeout(ready_timeout, read_control_frame(&mut read_half))
            .await
            .map_err(|_| timeout_err("agent READY frame"))?
            .map_err(DaemonError::Io)?;

        if code != agent_code::READY {
            return Err(DaemonError::Protocol(format!(
                "expected READY frame, got code {code}"
            )));
        }

        let client = Arc::new(Self {
            send_lock: Mutex::new(write_half),
            pending: parking_lot::Mutex::new(None),
            lost,
        });

        client.clone().spawn_reader(read_half, on_push);
        Ok(client)
    }

    fn spawn_reader(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        on_push: impl Fn(u32, Vec<u8>) + Send + Sync + 'static,
    ) {
        tokio::spawn(async move {
            loop {
                match read_control_frame(&mut read_half).await {
                    Ok((code, payload)) => {
                        if code == agent_code::ACK || code == agent_code::ERROR {
                            if let Some(tx) = self.pending.lock().take() {
                                let reply = if code == agent_code::ACK {
                                    ControlReply::Ack(payload)
                                } else {
                                    ControlReply::Error(
                                        String::from_utf8_lossy(&payload).into_owned(),
                                    )
                                };
                                let _ = tx.send(reply);
                            } else {
                                tracing::warn!(code, "control reply with no pending caller");
                            }
                        } else {
                            on_push(code, payload);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "agent control channel closed");
                        if let Some(tx) = self.pending.lock().take() {
                            let _ = tx.send(ControlReply::Error("vm lost".into()));
                        }
                        self.lost.cancel();
                        break;
                    }
                }
            }
        });
    }

    /// Send one command and await its reply, enforcing at-most-one
    /// in-flight request for the lifetime of the call (§4.3).
    pub async fn send_command(
        &self,
        code: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> DaemonResult<Vec<u8>> {
        let mut writer = self.send_lock.lock().await;

        if self.lost.is_cancelled() {
            return Err(DaemonError::VmLost("vm already lost".into()));
        }

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);

        if let Err(e) = write_control_frame(&mut writer, code, payload).await {
            self.pending.lock().take();
            return Err(DaemonError::Io(e));
        }

        let result = tokio::select! {
            reply = rx => match reply {
                Ok(ControlReply::Ack(bytes)) => Ok(bytes),
                Ok(ControlReply::Error(msg)) => Err(DaemonError::Agent(msg)),
                Err(_) => Err(DaemonError::VmLost("control channel closed".into())),
            },
            _ = self.lost.cancelled() => {
                self.pending.lock().take();
                Err(DaemonError::VmLost("vm lost while awaiting reply".into()))
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().take();
                self.lost.cancel();
                Err(timeout_err("agent reply"))
            }
        };

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair() -> (Arc<VmControlClient>, tokio::net::UnixStream) {
        let (host, mut agent) = tokio::net::UnixStream::pair().unwrap();
        // Write READY directly; the kernel buffers it until `connect` reads.
        {
            use tokio::io::AsyncWriteExt;
            let total_len = CONTROL_HEADER_LEN as u32;
            let mut buf = Vec::with_capacity(CONTROL_HEADER_LEN);
            buf.extend_from_slice(&agent_code::READY.to_be_bytes());
            buf.extend_from_slice(&total_len.to_be_bytes());
            agent.write_all(&buf).await.unwrap();
        }
        let client = VmControlClient::connect(
            host,
            Duration::from_secs(1),
            CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap();
        (client, agent)
    }

    #[tokio::test]
    async fn command_gets_ack_reply() {
        let (client, agent) = handshake_pair().await;
        let (mut read, mut write) = agent.into_split();

        let client2 = client.clone();
        let handle = tokio::spawn(async move {
            client2
                .send_command(1, b"ping", Duration::from_secs(1))
                .await
        });

        let (code, payload) = read_control_frame(&mut read).await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(payload, b"ping");
        write_control_frame(&mut write, agent_code::ACK, b"pong")
            .await
            .unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, b"pong");
    }

    #[tokio::test]
    async fn command_times_out_and_flags_lost() {
        let (client, _agent) = handshake_pair().await;
        let err = client
            .send_command(1, b"ping", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(client.lost.is_cancelled());
    }
}
