//! Agent I/O channel multiplexer (§4.5): fans sequence-numbered packets
//! to/from per-process sessions.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hyperproxy_protocol::opcode;

use crate::protocol::stream_frame;
use crate::vm::VmSessions;

const IO_HEADER_LEN: usize = 12;

async fn read_io_frame(reader: &mut OwnedReadHalf) -> std::io::Result<(u64, Vec<u8>)> {
    let mut header = [0u8; IO_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let sequence = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let total_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let payload_len = total_len.saturating_sub(IO_HEADER_LEN);
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok((sequence, payload))
}

async fn write_io_frame(
    writer: &mut OwnedWriteHalf,
    sequence: u64,
    payload: &[u8],
) -> std::io::Result<()> {
    let total_len = (IO_HEADER_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(IO_HEADER_LEN + payload.len());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await
}

/// Handle for sending outbound (shim -> agent) stdin packets. The actual
/// socket write half is owned exclusively by the writer task spawned in
/// [`spawn`] (§5: "one writer task, sole mutator of its direction").
#[derive(Clone)]
pub struct IoMuxHandle {
    outbound: mpsc::UnboundedSender<(u64, Vec<u8>)>,
}

impl IoMuxHandle {
    /// Forward an stdin packet tagged with a session's `io_base`. An empty
    /// payload is a legal half-close (§4.5).
    pub fn send_stdin(&self, io_base: u64, payload: Vec<u8>) {
        let _ = self.outbound.send((io_base, payload));
    }
}

/// Spawn the reader and writer tasks for one VM's I/O channel.
pub fn spawn(
    stream: tokio::net::UnixStream,
    sessions: VmSessions,
    lost: CancellationToken,
) -> IoMuxHandle {
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<(u64, Vec<u8>)>();

    let writer_lost = lost.clone();
    tokio::spawn(async move {
        let mut write_half = write_half;
        loop {
            tokio::select! {
                _ = writer_lost.cancelled() => break,
                msg = rx.recv() => {
                    match msg {
                        Some((seq, payload)) => {
                            if let Err(e) = write_io_frame(&mut write_half, seq, &payload).await {
                                tracing::warn!(error = %e, "io channel write failed");
                                writer_lost.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    tokio::spawn(run_reader(read_half, sessions, lost));

    IoMuxHandle { outbound: tx }
}

async fn run_reader(mut read_half: OwnedReadHalf, sessions: VmSessions, lost: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = lost.cancelled() => break,
            frame = read_io_frame(&mut read_half) => frame,
        };

        let (sequence, payload) = match frame {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "io channel read failed");
                lost.cancel();
                break;
            }
        };

        let Some(session) = sessions.find_by_sequence(sequence) else {
            tracing::warn!(sequence, "io packet addressed to unknown session, discarding");
            continue;
        };

        if sequence == session.io_base {
            if session.is_awaiting_exit() {
                let code = payload.first().copied().unwrap_or(0);
                if let Some(code) = session.record_exit(code)
                    && let Some(writer) = session.shim_writer()
                {
                    let header = hyperproxy_protocol::frame::FrameHeader::new(
                        hyperproxy_protocol::frame::FrameType::Notification,
                        opcode::PROCESS_EXITED,
                        1,
                    );
                    if let Err(e) = writer.write(&header, &[code]).await {
                        tracing::warn!(error = %e, "failed to deliver exit notification");
                    }
                }
                continue;
            }

            if payload.is_empty() {
                session.begin_exit_sequence();
                continue;
            }

            if let Some(writer) = session.shim_writer() {
                let (header, payload) = stream_frame(opcode::STDOUT, payload);
                if let Err(e) = writer.write(&header, &payload).await {
                    tracing::warn!(error = %e, "failed to forward stdout");
                }
            }
        } else if sequence == session.stderr_base() {
            if !payload.is_empty()
                && let Some(writer) = session.shim_writer()
            {
                let (header, payload) = stream_frame(opcode::STDERR, payload);
                if let Err(e) = writer.write(&header, &payload).await {
                    tracing::warn!(error = %e, "failed to forward stderr");
                }
            }
        }
    }
}
