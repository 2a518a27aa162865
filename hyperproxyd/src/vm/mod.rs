//! A registered VM: its two agent transports, session table, and lifecycle
//! state (§3, §4.3-§4.5).

pub mod control;
pub mod io_mux;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::session::Session;
use control::VmControlClient;
use io_mux::IoMuxHandle;

/// Sequence numbers above this offset are reserved for the null session
/// (requests not bound to any shim-visible process, §4.4).
const NULL_SESSION_IO_BASE: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Connecting,
    Ready,
    Lost,
    Closed,
}

/// Shared view of a VM's session table, handed to the I/O multiplexer so it
/// can resolve an inbound sequence number without reaching back through `Vm`.
#[derive(Clone)]
pub struct VmSessions {
    inner: Arc<Mutex<Vec<Arc<Session>>>>,
    null_session: Arc<Session>,
}

impl VmSessions {
    pub fn find_by_sequence(&self, sequence: u64) -> Option<Arc<Session>> {
        if sequence == self.null_session.io_base || sequence == self.null_session.stderr_base() {
            return Some(self.null_session.clone());
        }
        self.inner
            .lock()
            .iter()
            .find(|s| sequence == s.io_base || sequence == s.stderr_base())
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner.lock().clone()
    }
}

/// One registered VM: its control/io agent connections and the sessions
/// multiplexed onto them.
pub struct Vm {
    pub container_id: String,
    ctl_path: String,
    io_path: String,
    state: Mutex<VmState>,
    sessions: Arc<Mutex<Vec<Arc<Session>>>>,
    next_base: AtomicU64,
    pub null_session: Arc<Session>,
    pub lost: CancellationToken,
    control: tokio::sync::OnceCell<Arc<VmControlClient>>,
    io_mux: tokio::sync::OnceCell<IoMuxHandle>,
}

impl Vm {
    pub fn new(container_id: String, ctl_path: String, io_path: String) -> Arc<Self> {
        Arc::new(Self {
            container_id,
            ctl_path,
            io_path,
            state: Mutex::new(VmState::Connecting),
            sessions: Arc::new(Mutex::new(Vec::new())),
            next_base: AtomicU64::new(1),
            null_session: Session::new(String::new(), NULL_SESSION_IO_BASE),
            lost: CancellationToken::new(),
            control: tokio::sync::OnceCell::new(),
            io_mux: tokio::sync::OnceCell::new(),
        })
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub fn mark_ready(&self) {
        *self.state.lock() = VmState::Ready;
    }

    pub fn mark_lost(&self) {
        *self.state.lock() = VmState::Lost;
        self.lost.cancel();
    }

    pub fn mark_closed(&self) {
        *self.state.lock() = VmState::Closed;
        self.lost.cancel();
    }

    pub fn sessions_handle(&self) -> VmSessions {
        VmSessions {
            inner: self.sessions.clone(),
            null_session: self.null_session.clone(),
        }
    }

    /// Allocate a fresh session with a pair of sequence numbers
    /// (`io_base`, `io_base + 1`), as spec §4.4 requires.
    pub fn allocate_session(&self, token: String) -> Arc<Session> {
        let base = self.next_base.fetch_add(2, Ordering::SeqCst);
        let session = Session::new(token, base);
        self.sessions.lock().push(session.clone());
        session
    }

    pub fn find_session_by_token(&self, token: &str) -> Option<Arc<Session>> {
        if token.is_empty() {
            return Some(self.null_session.clone());
        }
        self.sessions.lock().iter().find(|s| s.token == token).cloned()
    }

    /// Connect to the agent over both transports, perform the control
    /// handshake, and start the I/O multiplexer. Idempotent: a second call
    /// is a protocol error, since a VM is connected exactly once (§4.3).
    pub async fn connect(
        self: &Arc<Self>,
        config: &DaemonConfig,
        on_push: impl Fn(u32, Vec<u8>) + Send + Sync + 'static,
    ) -> DaemonResult<()> {
        let ctl_stream = tokio::net::UnixStream::connect(&self.ctl_path)
            .await
            .map_err(DaemonError::Io)?;
        let io_stream = tokio::net::UnixStream::connect(&self.io_path)
            .await
            .map_err(DaemonError::Io)?;

        let client = VmControlClient::connect(
            ctl_stream,
            config.command_reply_timeout,
            self.lost.clone(),
            on_push,
        )
        .await?;
        self.control
            .set(client)
            .map_err(|_| DaemonError::Internal("vm already connected".into()))?;

        let mux = io_mux::spawn(io_stream, self.sessions_handle(), self.lost.clone());
        self.io_mux
            .set(mux)
            .map_err(|_| DaemonError::Internal("vm already connected".into()))?;

        self.mark_ready();
        Ok(())
    }

    pub fn control(&self) -> DaemonResult<&Arc<VmControlClient>> {
        self.control
            .get()
            .ok_or_else(|| DaemonError::Internal("vm control channel not connected".into()))
    }

    pub fn io_mux(&self) -> DaemonResult<&IoMuxHandle> {
        self.io_mux
            .get()
            .ok_or_else(|| DaemonError::Internal("vm io channel not connected".into()))
    }
}
