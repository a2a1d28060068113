//! Routes control messages to their handlers.
//!
//! A malformed line is logged and dropped. A handler that fails or panics is
//! reported as an `error` event scoped to the message's terminal; the host
//! keeps serving every other session.

use std::sync::Arc;

use crate::commands::{flow, query, terminal, CommandError};
use crate::ipc::ControlMessage;
use crate::panics;
use crate::state::HostState;

/// What the control loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Shutdown,
}

/// Parse and handle one inbound line.
pub fn dispatch_line(host: &Arc<HostState>, line: &str) -> Next {
    let line = line.trim();
    if line.is_empty() {
        return Next::Continue;
    }
    match ControlMessage::parse(line) {
        Ok(message) => dispatch(host, message),
        Err(e) => {
            log::warn!("dropping malformed control message: {e}");
            Next::Continue
        }
    }
}

pub fn dispatch(host: &Arc<HostState>, message: ControlMessage) -> Next {
    let kind = message.kind();
    let id = message.session_id().map(str::to_string);
    log::trace!("handling {kind}");

    match panics::catch(|| route(host, message)) {
        Ok(Ok(next)) => next,
        Ok(Err(e)) => {
            log::warn!("{kind} failed: {e}");
            host.sink.error(id.as_deref(), e.to_string());
            Next::Continue
        }
        Err(message) => {
            log::error!("{kind} handler panicked: {message}");
            host.sink
                .error(id.as_deref(), format!("{kind} failed: {message}"));
            Next::Continue
        }
    }
}

fn route(host: &Arc<HostState>, message: ControlMessage) -> Result<Next, CommandError> {
    match message {
        ControlMessage::Spawn { id, options } => {
            terminal::spawn(host, id, options)?;
        }
        ControlMessage::Write { id, data } => terminal::write(host, &id, &data)?,
        ControlMessage::Resize { id, cols, rows } => terminal::resize(host, &id, cols, rows)?,
        ControlMessage::Kill { id, reason } => terminal::kill(host, &id, reason),
        ControlMessage::Trash { id } => terminal::trash(host, &id)?,
        ControlMessage::Restore { id } => terminal::restore(host, &id),
        ControlMessage::FlushBuffer { id } => flow::flush_buffer(host, &id),
        ControlMessage::AcknowledgeData { id, bytes } => {
            terminal::acknowledge_data(host, &id, bytes)
        }
        ControlMessage::SetAnalysisEnabled { id, enabled } => {
            terminal::set_analysis_enabled(host, &id, enabled)
        }
        ControlMessage::GetSnapshot { id, request_id } => {
            query::get_snapshot(host, &id, request_id)
        }
        ControlMessage::GetAllSnapshots { request_id } => {
            query::get_all_snapshots(host, request_id)
        }
        ControlMessage::MarkChecked { id } => terminal::mark_checked(host, &id),
        ControlMessage::TransitionState {
            id,
            event,
            trigger,
            confidence,
            spawned_at,
            request_id,
        } => terminal::transition_state(
            host, &id, event, trigger, confidence, spawned_at, request_id,
        ),
        ControlMessage::HealthCheck { request_id } => query::health_check(host, request_id),
        ControlMessage::PauseAll => flow::pause_all(host),
        ControlMessage::ResumeAll => flow::resume_all(host),
        ControlMessage::GetTerminalsForProject {
            project_id,
            request_id,
        } => query::get_terminals_for_project(host, project_id, request_id),
        ControlMessage::GetTerminal { id, request_id } => {
            query::get_terminal(host, &id, request_id)
        }
        ControlMessage::ReplayHistory {
            id,
            max_lines,
            request_id,
        } => query::replay_history(host, &id, max_lines, request_id),
        ControlMessage::GetSerializedState { id, request_id } => {
            query::get_serialized_state(host, &id, request_id)
        }
        ControlMessage::GetTerminalInfo { id, request_id } => {
            query::get_terminal_info(host, &id, request_id)
        }
        ControlMessage::ForceResume { id } => flow::force_resume(host, &id),
        ControlMessage::Dispose => {
            flow::dispose(host);
            return Ok(Next::Shutdown);
        }
        ControlMessage::InitBuffers {
            visual_path,
            analysis_path,
        } => flow::init_buffers(host, visual_path.as_deref(), analysis_path.as_deref())?,
        ControlMessage::ConnectPort { socket_path } => flow::connect_port(host, socket_path),
    }
    Ok(Next::Continue)
}
