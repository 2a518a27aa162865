//! Daemon-wide registry of VMs and tokens (§3).
//!
//! Mirrors the teacher's `ExecutionRegistry`: a single short-held lock
//! guarding plain maps, no long waits performed while holding it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DaemonError, DaemonResult};
use crate::vm::Vm;

/// A token's binding state (§3): `allocated` until a shim claims it with
/// `ConnectShim`, `claimed` for as long as exactly one shim holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Allocated,
    Claimed,
}

struct TokenEntry {
    state: TokenState,
    vm: Arc<Vm>,
}

#[derive(Default)]
struct RegistryInner {
    vms: HashMap<String, Arc<Vm>>,
    tokens: HashMap<String, TokenEntry>,
}

/// Central registry resolving tokens to VMs. A token never embeds a VM
/// reference directly (§3) so it can be looked up only through here.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_vm(&self, vm: Arc<Vm>) -> DaemonResult<()> {
        let mut inner = self.inner.lock();
        if inner.vms.contains_key(&vm.container_id) {
            return Err(DaemonError::Registry(format!(
                "container id {} already registered",
                vm.container_id
            )));
        }
        inner.vms.insert(vm.container_id.clone(), vm);
        Ok(())
    }

    pub fn unregister_vm(&self, container_id: &str) -> DaemonResult<Arc<Vm>> {
        let mut inner = self.inner.lock();
        let vm = inner
            .vms
            .remove(container_id)
            .ok_or_else(|| DaemonError::Registry(format!("no such vm {container_id}")))?;
        inner.tokens.retain(|_, entry| !Arc::ptr_eq(&entry.vm, &vm));
        Ok(vm)
    }

    pub fn find_vm(&self, container_id: &str) -> Option<Arc<Vm>> {
        self.inner.lock().vms.get(container_id).cloned()
    }

    /// Mint and register a fresh, unclaimed token bound to `vm` (§4.4).
    pub fn allocate_token(&self, vm: Arc<Vm>) -> String {
        let mut inner = self.inner.lock();
        loop {
            let token = crate::token::generate_token();
            if !inner.tokens.contains_key(&token) {
                inner.tokens.insert(
                    token.clone(),
                    TokenEntry {
                        state: TokenState::Allocated,
                        vm,
                    },
                );
                return token;
            }
        }
    }

    pub fn resolve_token(&self, token: &str) -> Option<Arc<Vm>> {
        self.inner.lock().tokens.get(token).map(|e| e.vm.clone())
    }

    pub fn token_state(&self, token: &str) -> Option<TokenState> {
        self.inner.lock().tokens.get(token).map(|e| e.state)
    }

    /// Claim a token for a shim. Fails if already claimed (§3: one shim
    /// per token at a time).
    pub fn claim_token(&self, token: &str) -> DaemonResult<Arc<Vm>> {
        let mut inner = self.inner.lock();
        let entry = inner
            .tokens
            .get_mut(token)
            .ok_or_else(|| DaemonError::Registry(format!("unknown token {token}")))?;
        if entry.state == TokenState::Claimed {
            return Err(DaemonError::Registry(format!(
                "token {token} already claimed"
            )));
        }
        entry.state = TokenState::Claimed;
        Ok(entry.vm.clone())
    }

    /// Demote a claimed token back to `allocated` without removing it: a
    /// shim socket closing without `DisconnectShim`, or an explicit
    /// `DisconnectShim` (§4.2). The token and its session outlive the
    /// disconnect so a later `ConnectShim` with the same token re-attaches
    /// to the same session (§8's reconnect round-trip).
    pub fn release_token(&self, token: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.tokens.get_mut(token) {
            entry.state = TokenState::Allocated;
        }
    }
}
