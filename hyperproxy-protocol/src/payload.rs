//! JSON payload shapes carried inside command/stream/notification frames.
//!
//! Field names match the wire contract in the specification verbatim
//! (`containerId`, `numIOStreams`, ...) rather than being derived by a
//! blanket `rename_all`, since a couple of them (`numIOStreams`) aren't
//! plain camelCase of their Rust name.

use serde::{Deserialize, Serialize};

/// Opcode byte values for the client-facing frame protocol (§4.2).
pub mod opcode {
    // Commands (runtime/shim -> daemon)
    pub const REGISTER_VM: u8 = 1;
    pub const ATTACH_VM: u8 = 2;
    pub const UNREGISTER_VM: u8 = 3;
    pub const HYPER: u8 = 4;
    pub const CONNECT_SHIM: u8 = 5;
    pub const DISCONNECT_SHIM: u8 = 6;
    pub const SIGNAL: u8 = 7;

    // Stream frames accepted from clients
    pub const STDIN: u8 = 10;
    pub const LOG: u8 = 11;

    // Stream frames sent to clients
    pub const STDOUT: u8 = 12;
    pub const STDERR: u8 = 13;

    // Notifications sent to clients
    pub const PROCESS_EXITED: u8 = 20;
}

/// Reserved agent control-channel codes (§4.3, §6).
pub mod agent_code {
    pub const READY: u32 = 0xFFFF_FFFF;
    pub const ACK: u32 = 0xFFFF_FFFE;
    pub const ERROR: u32 = 0xFFFF_FFFD;
}

/// Agent command codes for the known hyper verbs. `ping`, `newcontainer`
/// and `execcmd` are forwarded from a client's `Hyper` request; `winsize`
/// and `killcontainer` are only ever sent internally by the signal handler
/// (§4.6).
pub mod agent_verb {
    pub const PING: u32 = 1;
    pub const NEWCONTAINER: u32 = 2;
    pub const EXECCMD: u32 = 3;
    pub const KILLCONTAINER: u32 = 4;
    pub const WINSIZE: u32 = 5;
}

/// Resolve a `Hyper` request's `hyperName` to its agent wire code.
pub fn code_for_hyper_name(name: &str) -> Option<u32> {
    match name {
        "ping" => Some(agent_verb::PING),
        "newcontainer" => Some(agent_verb::NEWCONTAINER),
        "execcmd" => Some(agent_verb::EXECCMD),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterVmRequest {
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "ctlSerial")]
    pub ctl_serial: String,
    #[serde(rename = "ioSerial")]
    pub io_serial: String,
    #[serde(default)]
    pub console: Option<String>,
    #[serde(rename = "numIOStreams", default)]
    pub num_io_streams: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachVmRequest {
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "numIOStreams", default)]
    pub num_io_streams: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterVmRequest {
    #[serde(rename = "containerId")]
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoAllocation {
    pub url: String,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoAllocationResult {
    pub io: IoAllocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperRequest {
    #[serde(rename = "hyperName")]
    pub hyper_name: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectShimRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectShimRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    #[serde(rename = "signalNumber")]
    pub signal_number: i32,
    #[serde(default)]
    pub columns: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
}

/// `log` stream payload (client -> daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub source: String,
    pub level: String,
    #[serde(rename = "containerId", default)]
    pub container_id: Option<String>,
    pub message: String,
}

/// Body of an `IN_ERROR` response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Verb names accepted by `log`'s `source` field.
pub const LOG_SOURCES: &[&str] = &["shim", "runtime"];

/// Verb names accepted by `log`'s `level` field.
pub const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// The two agent verbs whose `process.stdio`/`process.stderr` fields are
/// relocated to a session's sequence numbers (§4.4).
pub const RELOCATED_HYPER_VERBS: &[&str] = &["execcmd", "newcontainer"];
