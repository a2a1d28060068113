//! Terminal session lifecycle: spawn, input, resize, kill, trash/restore,
//! and agent state transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use termhost_pty::session::now_ms;
use termhost_pty::{
    AgentEvent, AgentState, PauseHolder, Registry, SessionId, SpawnOptions, StateTransition,
    StateTrigger,
};

use crate::bus::BusEvent;
use crate::commands::CommandError;
use crate::io_thread::{start_io_thread, ReaderContext, ReaderExit};
use crate::ipc::HostEvent;
use crate::state::HostState;

/// How long to wait for the OS to report an exit code after PTY EOF.
const REAP_ATTEMPTS: u32 = 20;
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Create a new terminal session.
///
/// Spawns the PTY, starts its reader thread, and answers with a `snapshot`
/// event for the new session. Returns the session id.
pub fn spawn(
    host: &Arc<HostState>,
    id: Option<SessionId>,
    options: SpawnOptions,
) -> Result<SessionId, CommandError> {
    let id = id.unwrap_or_else(Registry::generate_id);
    let spawned = host.registry().spawn(&id, &options)?;

    if host.is_throttling() {
        spawned.gate.hold(PauseHolder::Governor);
    }
    host.controller.register(&id, Arc::clone(&spawned.gate));

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let ctx = ReaderContext {
        id: id.clone(),
        generation: spawned.generation,
        kind: spawned.kind,
        info: spawned.info,
        gate: spawned.gate,
        channels: Arc::clone(&host.channels),
        controller: host.controller.clone(),
        sink: host.sink.clone(),
        bus: host.bus.clone(),
        exits: host.exits.clone(),
        poll_interval: host.config.backpressure.poll_interval(),
        max_pause: host.config.backpressure.max_pause(),
        ack_high_water: host.config.backpressure.ack_high_water_bytes,
    };
    if let Err(e) = start_io_thread(ctx, spawned.reader, signal_rx) {
        host.controller.unregister(&id);
        host.registry().kill(&id);
        return Err(CommandError::Reader(e));
    }
    host.add_reader(&id, signal_tx);

    log::info!("spawned terminal {id} ({})", spawned.kind.as_str());
    if spawned.kind.is_agent() {
        host.bus.publish(BusEvent::AgentSpawned {
            id: id.clone(),
            agent: spawned.kind,
        });
    }

    let snapshot = host.registry().snapshot(&id);
    host.sink.emit(HostEvent::Snapshot {
        request_id: None,
        id: id.clone(),
        snapshot,
    });
    Ok(id)
}

/// Write user input to a session. Unknown ids are ignored.
pub fn write(host: &HostState, id: &str, data: &str) -> Result<(), CommandError> {
    host.registry().write(id, data.as_bytes())?;
    Ok(())
}

pub fn resize(
    host: &HostState,
    id: &str,
    cols: Option<f64>,
    rows: Option<f64>,
) -> Result<(), CommandError> {
    if let Some((cols, rows)) = host.registry().resize(id, cols, rows)? {
        log::debug!("terminal {id} resized to {cols}x{rows}");
    }
    Ok(())
}

/// Kill a session and report its exit.
pub fn kill(host: &HostState, id: &str, reason: Option<String>) {
    host.remove_reader(id);
    host.controller.unregister(id);

    let exited = host.registry().kill(id);
    let Some(exited) = exited else {
        log::warn!("kill of unknown terminal {id} ignored");
        return;
    };
    log::info!(
        "killed terminal {id} ({})",
        reason.as_deref().unwrap_or("requested")
    );

    if exited.kind.is_agent() {
        host.bus.publish(BusEvent::AgentKilled {
            id: exited.id.clone(),
            agent: exited.kind,
            reason: reason.clone(),
        });
    }
    host.sink.emit(HostEvent::Exit {
        id: exited.id,
        exit_code: exited.exit_code,
        reason,
    });
}

pub fn trash(host: &HostState, id: &str) -> Result<(), CommandError> {
    let expires_at = host
        .registry()
        .trash(id, host.config.sessions.trash_ttl())
        .ok_or_else(|| CommandError::UnknownTerminal(id.to_string()))?;
    host.bus.publish(BusEvent::TerminalTrashed {
        id: id.to_string(),
        expires_at,
    });
    Ok(())
}

pub fn restore(host: &HostState, id: &str) {
    let restored = host.registry().restore(id);
    if restored {
        host.bus.publish(BusEvent::TerminalRestored { id: id.to_string() });
    } else {
        log::warn!("terminal {id} is not trashed or already expired, restore ignored");
    }
}

/// Kill every trashed session whose expiry has passed.
pub fn sweep_expired_trash(host: &HostState) {
    let expired = host.registry().expired_trash(now_ms());
    for id in expired {
        kill(host, &id, Some("trash-expired".to_string()));
    }
}

/// Count fallback output as consumed, letting the reader go once the
/// backlog is at the low watermark.
pub fn acknowledge_data(host: &HostState, id: &str, bytes: u64) {
    let remaining = host.registry().acknowledge_data(id, bytes);
    let Some(remaining) = remaining else {
        log::debug!("acknowledgement for unknown terminal {id} ignored");
        return;
    };
    if remaining > host.config.backpressure.ack_low_water_bytes {
        return;
    }
    let released = host.registry().resume(id, PauseHolder::Acknowledgement);
    if released {
        log::debug!("terminal {id} resumed: fallback output acknowledged");
        host.controller.refresh(id);
    }
}

pub fn set_analysis_enabled(host: &HostState, id: &str, enabled: bool) {
    if !host.registry().set_analysis_enabled(id, enabled) {
        log::debug!("set-analysis-enabled for unknown terminal {id} ignored");
    }
}

pub fn mark_checked(host: &HostState, id: &str) {
    if !host.registry().mark_checked(id) {
        log::debug!("mark-checked for unknown terminal {id} ignored");
    }
}

/// Relay a transition request and answer with `transition-result`.
pub fn transition_state(
    host: &HostState,
    id: &str,
    event: AgentEvent,
    trigger: StateTrigger,
    confidence: f64,
    spawned_at: Option<i64>,
    request_id: Option<String>,
) {
    let transition = host
        .registry()
        .transition_state(id, event, trigger, confidence, spawned_at);
    if let Some(transition) = &transition {
        publish_transition(host, id, transition);
    }
    host.sink.emit(HostEvent::TransitionResult {
        request_id,
        id: id.to_string(),
        success: transition.is_some(),
    });
}

fn publish_transition(host: &HostState, id: &str, transition: &StateTransition) {
    host.bus.publish(BusEvent::AgentState {
        id: id.to_string(),
        transition: *transition,
    });
    match transition.state {
        AgentState::Completed => host.bus.publish(BusEvent::AgentCompleted { id: id.to_string() }),
        AgentState::Failed => host.bus.publish(BusEvent::AgentFailed { id: id.to_string() }),
        _ => {}
    }
}

/// Clean up after a session whose reader hit EOF.
///
/// Gives the OS a moment to report the exit code, then removes the session
/// and emits `exit`. An exit from an earlier session under the same id, or
/// one already removed by `kill`, is ignored.
pub async fn reap_exited(host: Arc<HostState>, exit: ReaderExit) {
    let mut attempts = 0;
    loop {
        let generation = host.registry().generation(&exit.id);
        if generation != Some(exit.generation) {
            log::debug!("exit of an earlier terminal {} ignored", exit.id);
            return;
        }
        let status = host.registry().exit_status(&exit.id);
        if status.is_some() || attempts >= REAP_ATTEMPTS {
            break;
        }
        attempts += 1;
        tokio::time::sleep(REAP_INTERVAL).await;
    }
    finish_exited(&host, &exit.id);
}

fn finish_exited(host: &HostState, id: &str) {
    let exit_code = host.registry().exit_status(id);
    let Some(exit_code) = exit_code else {
        // The PTY closed under a live child; never drop it unkilled.
        log::warn!("terminal {id} closed its PTY but is still running, killing it");
        kill(host, id, Some("pty-closed".to_string()));
        return;
    };
    host.remove_reader(id);
    host.controller.unregister(id);

    let event = match exit_code {
        0 => AgentEvent::Exit,
        _ => AgentEvent::Error,
    };
    let transition = host
        .registry()
        .transition_state(id, event, StateTrigger::Exit, 1.0, None);

    let exited = host.registry().remove_exited(id);
    let Some(exited) = exited else {
        return;
    };
    if exited.kind.is_agent() {
        if let Some(transition) = &transition {
            publish_transition(host, id, transition);
        }
    }
    log::info!("terminal {id} exited with {:?}", exited.exit_code);
    host.sink.emit(HostEvent::Exit {
        id: exited.id,
        exit_code: exited.exit_code,
        reason: None,
    });
}
