//! Command and stream verb implementations (§4.2, §4.4, §4.6).

use hyperproxy_protocol::{
    AttachVmRequest, ConnectShimRequest, HyperRequest, IoAllocation, IoAllocationResult,
    LOG_LEVELS, LOG_SOURCES, LogPayload, RELOCATED_HYPER_VERBS, RegisterVmRequest, SignalRequest,
    UnregisterVmRequest, agent_verb, code_for_hyper_name, opcode,
};
use serde::de::DeserializeOwned;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::registry::Registry;
use crate::vm::Vm;

use super::{ClientState, HandlerOutcome};

/// First POSIX real-time-agnostic signal; standard signals occupy 1..=31.
const SIGWINCH: i32 = 28;

fn parse_json<T: DeserializeOwned>(payload: &[u8]) -> DaemonResult<T> {
    serde_json::from_slice(payload).map_err(|e| DaemonError::Protocol(format!("bad json: {e}")))
}

pub async fn dispatch_command(
    state: &mut ClientState,
    registry: &Registry,
    config: &DaemonConfig,
    op: u8,
    payload: &[u8],
) -> DaemonResult<HandlerOutcome> {
    match op {
        opcode::REGISTER_VM => register_vm(state, registry, config, payload).await,
        opcode::ATTACH_VM => attach_vm(state, registry, config, payload).await,
        opcode::UNREGISTER_VM => unregister_vm(state, registry, payload).await,
        opcode::HYPER => hyper(state, config, payload).await,
        opcode::CONNECT_SHIM => connect_shim(state, registry, payload).await,
        opcode::DISCONNECT_SHIM => disconnect_shim(state, registry).await,
        opcode::SIGNAL => signal(state, config, payload).await,
        other => Err(DaemonError::Protocol(format!("unknown command opcode {other}"))),
    }
}

pub async fn dispatch_stream(
    state: &mut ClientState,
    _registry: &Registry,
    config: &DaemonConfig,
    op: u8,
    payload: Vec<u8>,
) -> DaemonResult<()> {
    match op {
        opcode::STDIN => stdin(state, config, payload).await,
        opcode::LOG => log_stream(payload),
        other => Err(DaemonError::Protocol(format!("unknown stream opcode {other}"))),
    }
}

async fn register_vm(
    state: &mut ClientState,
    registry: &Registry,
    config: &DaemonConfig,
    payload: &[u8],
) -> DaemonResult<HandlerOutcome> {
    let req: RegisterVmRequest = parse_json(payload)?;
    if registry.find_vm(&req.container_id).is_some() {
        return Err(DaemonError::Registry(format!(
            "container id {} already registered",
            req.container_id
        )));
    }
    let vm = Vm::new(req.container_id.clone(), req.ctl_serial.clone(), req.io_serial.clone());
    vm.connect(config, |code, _payload| {
        tracing::debug!(code, "unhandled agent control push");
    })
    .await?;
    registry.register_vm(vm.clone())?;
    let tokens = allocate_tokens(&vm, registry, req.num_io_streams.unwrap_or(0));
    state.vm = Some(vm);
    Ok(HandlerOutcome::Json(
        serde_json::to_value(IoAllocationResult {
            io: IoAllocation {
                url: format!("unix://{}", config.socket_path.display()),
                tokens,
            },
        })
        .map_err(|e| DaemonError::Internal(format!("json encode: {e}")))?,
    ))
}

async fn attach_vm(
    state: &mut ClientState,
    registry: &Registry,
    config: &DaemonConfig,
    payload: &[u8],
) -> DaemonResult<HandlerOutcome> {
    let req: AttachVmRequest = parse_json(payload)?;
    let vm = registry
        .find_vm(&req.container_id)
        .ok_or_else(|| DaemonError::Registry(format!("no such vm {}", req.container_id)))?;
    if vm.state() == crate::vm::VmState::Lost {
        return Err(DaemonError::VmLost(format!("vm {} is lost", req.container_id)));
    }
    let tokens = allocate_tokens(&vm, registry, req.num_io_streams.unwrap_or(0));
    state.vm = Some(vm);
    Ok(HandlerOutcome::Json(
        serde_json::to_value(IoAllocationResult {
            io: IoAllocation {
                url: format!("unix://{}", config.socket_path.display()),
                tokens,
            },
        })
        .map_err(|e| DaemonError::Internal(format!("json encode: {e}")))?,
    ))
}

fn allocate_tokens(vm: &std::sync::Arc<Vm>, registry: &Registry, count: u32) -> Vec<String> {
    (0..count)
        .map(|_| {
            let token = registry.allocate_token(vm.clone());
            vm.allocate_session(token.clone());
            token
        })
        .collect()
}

async fn unregister_vm(
    state: &mut ClientState,
    registry: &Registry,
    payload: &[u8],
) -> DaemonResult<HandlerOutcome> {
    let req: UnregisterVmRequest = parse_json(payload)?;
    let vm = registry.unregister_vm(&req.container_id)?;
    vm.mark_closed();
    if state.vm.as_ref().is_some_and(|v| v.container_id == req.container_id) {
        state.vm = None;
    }
    Ok(HandlerOutcome::Empty)
}

async fn hyper(state: &mut ClientState, config: &DaemonConfig, payload: &[u8]) -> DaemonResult<HandlerOutcome> {
    let req: HyperRequest = parse_json(payload)?;
    let vm = state
        .vm
        .clone()
        .ok_or_else(|| DaemonError::Protocol("client not attached to a vm".into()))?;

    let code = code_for_hyper_name(&req.hyper_name)
        .ok_or_else(|| DaemonError::Protocol(format!("unknown hyper verb {}", req.hyper_name)))?;

    let relocated = RELOCATED_HYPER_VERBS.contains(&req.hyper_name.as_str());

    if !relocated && !req.tokens.is_empty() {
        return Err(DaemonError::Protocol(format!(
            "tokens not permitted for verb {}",
            req.hyper_name
        )));
    }

    let mut data = req.data;

    if relocated {
        let session = match req.tokens.as_slice() {
            [] => vm.null_session.clone(),
            [token] => vm
                .find_session_by_token(token)
                .ok_or_else(|| DaemonError::Registry(format!("unknown token {token}")))?,
            _ => return Err(DaemonError::Protocol("at most one token permitted".into())),
        };

        if let Some(cid) = data.get("containerId").and_then(|v| v.as_str()) {
            session.set_container_id(cid.to_string());
        }

        let process = data
            .get_mut("process")
            .ok_or_else(|| DaemonError::Protocol("missing process field".into()))?;

        let inbound_stdio = process.get("stdio").and_then(|v| v.as_u64()).unwrap_or(0);
        let inbound_stderr = process.get("stderr").and_then(|v| v.as_u64()).unwrap_or(0);
        if inbound_stdio != 0 || inbound_stderr != 0 {
            return Err(DaemonError::Protocol(
                "inbound process.stdio/stderr must be zero".into(),
            ));
        }

        let terminal = process.get("terminal").and_then(|v| v.as_bool()).unwrap_or(false);
        process["stdio"] = serde_json::Value::from(session.io_base);
        process["stderr"] = if terminal {
            serde_json::Value::from(0)
        } else {
            serde_json::Value::from(session.stderr_base())
        };

        let is_null_session = std::sync::Arc::ptr_eq(&session, &vm.null_session);
        if !is_null_session && !session.shim_attached.is_fired() {
            session
                .shim_attached
                .wait(config.wait_for_shim_timeout, &vm.lost, "shim attach")
                .await?;
        }

        let payload_bytes = serde_json::to_vec(&data)
            .map_err(|e| DaemonError::Internal(format!("json encode: {e}")))?;
        let reply = vm
            .control()?
            .send_command(code, &payload_bytes, config.command_reply_timeout)
            .await?;
        session.mark_started();
        return Ok(HandlerOutcome::Raw(reply));
    }

    let payload_bytes = if data.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(&data).map_err(|e| DaemonError::Internal(format!("json encode: {e}")))?
    };
    let reply = vm
        .control()?
        .send_command(code, &payload_bytes, config.command_reply_timeout)
        .await?;
    Ok(HandlerOutcome::Raw(reply))
}

async fn connect_shim(
    state: &mut ClientState,
    registry: &Registry,
    payload: &[u8],
) -> DaemonResult<HandlerOutcome> {
    let req: ConnectShimRequest = parse_json(payload)?;
    let vm = registry.claim_token(&req.token)?;
    let session = vm
        .find_session_by_token(&req.token)
        .ok_or_else(|| DaemonError::Internal("claimed token has no session".into()))?;

    let buffered_exit = session.attach_shim(state.writer.clone(), state.client_id);

    state.vm = Some(vm);
    state.session = Some(session);
    state.claimed_token = Some(req.token);

    if let Some(code) = buffered_exit {
        let header = hyperproxy_protocol::frame::FrameHeader::new(
            hyperproxy_protocol::frame::FrameType::Notification,
            opcode::PROCESS_EXITED,
            1,
        );
        state.writer.write(&header, &[code]).await?;
    }

    Ok(HandlerOutcome::Empty)
}

async fn disconnect_shim(state: &mut ClientState, registry: &Registry) -> DaemonResult<HandlerOutcome> {
    let token = state
        .claimed_token
        .take()
        .ok_or_else(|| DaemonError::Protocol("no claimed token to disconnect".into()))?;
    if let Some(session) = state.session.take() {
        session.detach_shim();
    }
    registry.release_token(&token);
    Ok(HandlerOutcome::Empty)
}

async fn signal(state: &mut ClientState, config: &DaemonConfig, payload: &[u8]) -> DaemonResult<HandlerOutcome> {
    let req: SignalRequest = parse_json(payload)?;
    let vm = state
        .vm
        .clone()
        .ok_or_else(|| DaemonError::Protocol("client not attached to a vm".into()))?;
    let session = state
        .session
        .clone()
        .ok_or_else(|| DaemonError::Protocol("client has no claimed session".into()))?;

    if !(1..=31).contains(&req.signal_number) {
        return Err(DaemonError::Protocol(format!(
            "signal number {} out of posix range",
            req.signal_number
        )));
    }

    let is_winch = req.signal_number == SIGWINCH;
    if is_winch {
        if req.columns.unwrap_or(0) == 0 || req.rows.unwrap_or(0) == 0 {
            return Err(DaemonError::Protocol(
                "SIGWINCH requires nonzero columns and rows".into(),
            ));
        }
    } else if req.columns.unwrap_or(0) != 0 || req.rows.unwrap_or(0) != 0 {
        return Err(DaemonError::Protocol(
            "columns/rows only permitted with SIGWINCH".into(),
        ));
    }

    session
        .process_started
        .wait(config.wait_for_process_timeout, &vm.lost, "process start")
        .await?;

    let payload_bytes = if is_winch {
        serde_json::json!({
            "seq": session.io_base,
            "columns": req.columns,
            "rows": req.rows,
        })
    } else {
        serde_json::json!({
            "containerId": vm.container_id,
            "signal": req.signal_number,
        })
    };
    let code = if is_winch {
        agent_verb::WINSIZE
    } else {
        agent_verb::KILLCONTAINER
    };
    let payload_bytes = serde_json::to_vec(&payload_bytes)
        .map_err(|e| DaemonError::Internal(format!("json encode: {e}")))?;
    vm.control()?
        .send_command(code, &payload_bytes, config.command_reply_timeout)
        .await?;
    Ok(HandlerOutcome::Empty)
}

async fn stdin(state: &mut ClientState, config: &DaemonConfig, payload: Vec<u8>) -> DaemonResult<()> {
    let vm = state
        .vm
        .clone()
        .ok_or_else(|| DaemonError::Protocol("client not attached to a vm".into()))?;
    let session = state
        .session
        .clone()
        .ok_or_else(|| DaemonError::Protocol("client has no claimed session".into()))?;

    if !session.process_started.is_fired() {
        session
            .process_started
            .wait(config.wait_for_process_timeout, &vm.lost, "process start")
            .await?;
    }

    vm.io_mux()?.send_stdin(session.io_base, payload);
    Ok(())
}

fn log_stream(payload: Vec<u8>) -> DaemonResult<()> {
    let entry: LogPayload = parse_json(&payload)?;
    if !LOG_SOURCES.contains(&entry.source.as_str()) {
        return Err(DaemonError::Protocol(format!("invalid log source {}", entry.source)));
    }
    if !LOG_LEVELS.contains(&entry.level.as_str()) {
        return Err(DaemonError::Protocol(format!("invalid log level {}", entry.level)));
    }
    if entry.message.is_empty() {
        return Err(DaemonError::Protocol("empty log message".into()));
    }

    match entry.level.as_str() {
        "debug" => tracing::debug!(source = %entry.source, container_id = ?entry.container_id, "{}", entry.message),
        "info" => tracing::info!(source = %entry.source, container_id = ?entry.container_id, "{}", entry.message),
        "warn" => tracing::warn!(source = %entry.source, container_id = ?entry.container_id, "{}", entry.message),
        "error" => tracing::error!(source = %entry.source, container_id = ?entry.container_id, "{}", entry.message),
        _ => unreachable!("validated above"),
    }
    Ok(())
}
