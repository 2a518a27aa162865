//! I/O session: the per-shim-backed-process record (§3).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{DaemonResult, timeout_err};
use crate::protocol::SharedWriter;

/// A one-shot event that can be waited on (possibly after it already
/// fired) with a bound on how long to wait. Used for both
/// `process_started` and `shim_attached` (§3, §4.4, §4.6).
#[derive(Default)]
pub struct Gate {
    fired: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait for the gate to fire, bounded by `timeout` and by `cancel`
    /// (e.g. a VM-lost cancellation token). Returns a timeout error whose
    /// message contains "timeout" on expiry.
    pub async fn wait(
        &self,
        timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
        what: &str,
    ) -> DaemonResult<()> {
        if self.is_fired() {
            return Ok(());
        }
        let wait_fut = async {
            loop {
                let notified = self.notify.notified();
                if self.is_fired() {
                    return;
                }
                notified.await;
                if self.is_fired() {
                    return;
                }
            }
        };
        tokio::select! {
            _ = wait_fut => Ok(()),
            _ = cancel.cancelled() => Err(crate::error::DaemonError::VmLost(format!("vm lost while waiting for {what}"))),
            _ = tokio::time::sleep(timeout) => Err(timeout_err(what)),
        }
    }
}

/// A shim socket currently attached to a session.
pub struct ShimHandle {
    pub writer: SharedWriter,
    pub client_id: u64,
}

/// The shim attachment and any exit status buffered while detached, guarded
/// by one lock so attach and exit-delivery can't race each other: whichever
/// of "shim attaches" and "exit arrives" happens first under the lock is
/// the one the other sees (§3, §8 "delivered exactly once").
#[derive(Default)]
struct ShimState {
    shim: Option<ShimHandle>,
    pending_exit: Option<u8>,
}

/// One I/O session per shim-backed process (§3).
pub struct Session {
    pub token: String,
    pub io_base: u64,
    container_id: Mutex<Option<String>>,
    shim: Mutex<ShimState>,
    pub process_started: Gate,
    pub shim_attached: Gate,
    /// Set once a zero-length frame on `io_base` has been seen; the next
    /// frame on `io_base` is the exit-status byte (§4.5).
    awaiting_exit: AtomicBool,
}

impl Session {
    pub fn new(token: String, io_base: u64) -> Arc<Self> {
        Arc::new(Self {
            token,
            io_base,
            container_id: Mutex::new(None),
            shim: Mutex::new(ShimState::default()),
            process_started: Gate::new(),
            shim_attached: Gate::new(),
            awaiting_exit: AtomicBool::new(false),
        })
    }

    pub fn stderr_base(&self) -> u64 {
        self.io_base + 1
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id.lock().clone()
    }

    pub fn set_container_id(&self, id: String) {
        let mut slot = self.container_id.lock();
        if slot.is_none() {
            *slot = Some(id);
        }
    }

    /// Attach a shim socket, returning any exit status that was buffered
    /// while no shim was attached so the caller can flush it (§3, §8).
    pub fn attach_shim(&self, writer: SharedWriter, client_id: u64) -> Option<u8> {
        let mut state = self.shim.lock();
        state.shim = Some(ShimHandle { writer, client_id });
        self.shim_attached.fire();
        state.pending_exit.take()
    }

    pub fn detach_shim(&self) {
        self.shim.lock().shim = None;
    }

    pub fn shim_writer(&self) -> Option<SharedWriter> {
        self.shim.lock().shim.as_ref().map(|h| h.writer.clone())
    }

    pub fn has_shim(&self) -> bool {
        self.shim.lock().shim.is_some()
    }

    pub fn is_claimed_by(&self, client_id: u64) -> bool {
        self.shim
            .lock()
            .shim
            .as_ref()
            .is_some_and(|h| h.client_id == client_id)
    }

    pub fn mark_started(&self) {
        self.process_started.fire();
    }

    pub fn begin_exit_sequence(&self) {
        self.awaiting_exit.store(true, Ordering::SeqCst);
    }

    pub fn is_awaiting_exit(&self) -> bool {
        self.awaiting_exit.load(Ordering::SeqCst)
    }

    /// Record an exit status. Returns `Some(code)` if a shim is attached
    /// and should be notified immediately; otherwise buffers it. Checking
    /// for an attached shim and buffering the status happen under the same
    /// lock as `attach_shim`'s flush, so the two can't interleave.
    pub fn record_exit(&self, code: u8) -> Option<u8> {
        self.awaiting_exit.store(false, Ordering::SeqCst);
        let mut state = self.shim.lock();
        if state.shim.is_some() {
            Some(code)
        } else {
            state.pending_exit = Some(code);
            None
        }
    }
}
