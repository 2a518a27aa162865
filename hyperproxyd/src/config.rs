//! Daemon configuration surface (ambient stack; §1 excludes config *file*
//! loading, not the config type itself — see `SPEC_FULL.md`).

use std::path::PathBuf;
use std::time::Duration;

/// Default client socket path, overridable via `--socket-path`.
pub const DEFAULT_SOCKET_PATH: &str = "/run/hyperproxy/hyperproxy.sock";

/// Ceiling on a frame's declared payload length (§4.1: "failing on ...
/// payload_length exceeding a configured ceiling").
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Bounds a single agent control-channel request (§4.3).
    pub command_reply_timeout: Duration,
    /// Bounds `execcmd`/`newcontainer`'s wait for `ConnectShim` (§4.4).
    pub wait_for_shim_timeout: Duration,
    /// Bounds stdin/signal handlers' wait for `process_started` (§4.5, §4.6).
    pub wait_for_process_timeout: Duration,
    pub max_payload_len: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            command_reply_timeout: Duration::from_secs(5),
            wait_for_shim_timeout: Duration::from_secs(5),
            wait_for_process_timeout: Duration::from_secs(5),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}
