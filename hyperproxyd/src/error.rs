//! Error taxonomy (§7).

use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Malformed frame, unknown opcode, bad JSON, token-violation (§7.1).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Duplicate container-id, unknown container-id, unknown/claimed token (§7.2).
    #[error("registry error: {0}")]
    Registry(String),

    /// Shim-attach, process-start, or agent-reply timeout (§7.3). Message
    /// always contains the word "timeout" — see [`timeout_err`].
    #[error("{0}")]
    Timeout(String),

    /// The agent replied with an ERROR frame (§7.4).
    #[error("agent error: {0}")]
    Agent(String),

    /// The agent control or I/O channel broke (§7.5).
    #[error("vm lost: {0}")]
    VmLost(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Build a [`DaemonError::Timeout`] whose message is guaranteed to contain
/// "timeout", per the testable property in §7/§8.
pub fn timeout_err(op: &str) -> DaemonError {
    DaemonError::Timeout(format!("timeout waiting for {op}"))
}

impl DaemonError {
    /// True for the subset of errors that must be reported in-band as an
    /// `IN_ERROR` response rather than by closing the socket (§4.8, §7).
    pub fn is_recoverable_for_command(&self) -> bool {
        !matches!(self, DaemonError::Io(_))
    }
}
