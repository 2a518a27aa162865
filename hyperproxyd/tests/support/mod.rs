//! Shared fixtures for the end-to-end scenario tests: a real daemon bound
//! to a temp socket, and small helpers that speak the client frame codec
//! and a hand-rolled agent side of the control/io wire formats.

use std::path::PathBuf;
use std::time::Duration;

use hyperproxy_protocol::agent_code;
use hyperproxy_protocol::frame::{FrameHeader, FrameType};
use hyperproxyd::protocol::{read_frame, write_frame};
use hyperproxyd::{Daemon, DaemonConfig};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub struct TestEnv {
    pub dir: TempDir,
    pub client_socket: PathBuf,
}

/// Start a daemon on a fresh temp socket with short timeouts so waits in
/// negative-path tests (timeouts, shim-attach misses) resolve quickly.
pub async fn start_daemon() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let client_socket = dir.path().join("hyperproxy.sock");
    let config = DaemonConfig {
        socket_path: client_socket.clone(),
        command_reply_timeout: Duration::from_secs(2),
        wait_for_shim_timeout: Duration::from_millis(300),
        wait_for_process_timeout: Duration::from_millis(150),
        ..DaemonConfig::default()
    };
    let daemon = Daemon::new(config);
    tokio::spawn(async move {
        let _ = daemon.run().await;
    });
    for _ in 0..200 {
        if client_socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    TestEnv { dir, client_socket }
}

pub async fn connect_client(env: &TestEnv) -> UnixStream {
    UnixStream::connect(&env.client_socket).await.unwrap()
}

pub fn agent_paths(env: &TestEnv) -> (PathBuf, PathBuf) {
    (env.dir.path().join("ctl.sock"), env.dir.path().join("io.sock"))
}

pub async fn send_command(stream: &mut UnixStream, op: u8, payload: &[u8]) {
    let header = FrameHeader::new(FrameType::Command, op, payload.len() as u32);
    write_frame(stream, &header, payload).await.unwrap();
}

pub async fn send_stream(stream: &mut UnixStream, op: u8, payload: &[u8]) {
    let header = FrameHeader::new(FrameType::Stream, op, payload.len() as u32);
    write_frame(stream, &header, payload).await.unwrap();
}

pub async fn recv_frame(stream: &mut UnixStream) -> (FrameHeader, Vec<u8>) {
    read_frame(stream, 1 << 20).await.unwrap()
}

const CONTROL_HEADER_LEN: usize = 8;
const IO_HEADER_LEN: usize = 12;

pub async fn agent_read_control(read: &mut OwnedReadHalf) -> (u32, Vec<u8>) {
    let mut header = [0u8; CONTROL_HEADER_LEN];
    read.read_exact(&mut header).await.unwrap();
    let code = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let total_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; total_len - CONTROL_HEADER_LEN];
    read.read_exact(&mut payload).await.unwrap();
    (code, payload)
}

pub async fn agent_write_control(write: &mut OwnedWriteHalf, code: u32, payload: &[u8]) {
    let total_len = (CONTROL_HEADER_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(payload);
    write.write_all(&buf).await.unwrap();
}

pub async fn agent_write_ready(write: &mut OwnedWriteHalf) {
    agent_write_control(write, agent_code::READY, &[]).await;
}

pub async fn agent_write_io(write: &mut OwnedWriteHalf, sequence: u64, payload: &[u8]) {
    let total_len = (IO_HEADER_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(payload);
    write.write_all(&buf).await.unwrap();
}

pub async fn agent_read_io(read: &mut OwnedReadHalf) -> (u64, Vec<u8>) {
    let mut header = [0u8; IO_HEADER_LEN];
    read.read_exact(&mut header).await.unwrap();
    let sequence = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let total_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; total_len - IO_HEADER_LEN];
    read.read_exact(&mut payload).await.unwrap();
    (sequence, payload)
}
