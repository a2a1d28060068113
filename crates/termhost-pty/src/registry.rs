use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cwd::resolve_cwd;
use crate::gate::{PauseGate, PauseHolder};
use crate::pty::{default_shell, PtyError, PtyHandle, SpawnCommand};
use crate::session::{
    clamp_dimension, now_ms, Lifecycle, Session, SessionId, SessionInfo, TerminalDiagnostics,
    TerminalKind, TerminalSnapshot, DEFAULT_COLS, DEFAULT_ROWS,
};
use crate::state_machine::{
    AgentEvent, AgentStateMachine, DefaultStateMachine, StateTransition, StateTrigger,
};

/// How long `kill` waits for the killed process to report its exit code.
const KILL_EXIT_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("terminal {0} already exists")]
    AlreadyExists(SessionId),
    #[error("terminal {0} has no PTY reader")]
    ReaderUnavailable(SessionId),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Options accepted by [`Registry::spawn`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnOptions {
    pub cwd: Option<String>,
    pub project_path: Option<String>,
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cols: Option<f64>,
    pub rows: Option<f64>,
    #[serde(rename = "type")]
    pub kind: TerminalKind,
    pub title: Option<String>,
    pub project_id: Option<String>,
    pub worktree_id: Option<String>,
    pub analysis_enabled: bool,
}

/// What the caller needs to drive a freshly spawned session's output.
pub struct SpawnedSession {
    pub id: SessionId,
    pub generation: u64,
    pub kind: TerminalKind,
    pub reader: Box<dyn Read + Send>,
    pub info: Arc<Mutex<SessionInfo>>,
    pub gate: Arc<PauseGate>,
}

/// A session removed from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitedSession {
    pub id: SessionId,
    pub kind: TerminalKind,
    pub exit_code: Option<u32>,
}

/// Owns every terminal session, keyed by id.
///
/// The registry is the only owner of PTY handles; callers refer to sessions
/// by id and get back snapshots, never handles.
pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    machine: Box<dyn AgentStateMachine>,
    history_lines: usize,
    next_generation: u64,
}

impl Registry {
    /// Create an empty registry with the default state machine.
    pub fn new(history_lines: usize) -> Self {
        Self::with_state_machine(history_lines, Box::new(DefaultStateMachine::default()))
    }

    pub fn with_state_machine(history_lines: usize, machine: Box<dyn AgentStateMachine>) -> Self {
        Self {
            sessions: HashMap::new(),
            machine,
            history_lines,
            next_generation: 1,
        }
    }

    /// A fresh id for callers that do not supply one.
    pub fn generate_id() -> SessionId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Spawn a PTY for `id`.
    ///
    /// Fails with [`RegistryError::AlreadyExists`] while a session with that
    /// id is live or trashed.
    pub fn spawn(
        &mut self,
        id: &str,
        options: &SpawnOptions,
    ) -> Result<SpawnedSession, RegistryError> {
        if self.sessions.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }

        let cols = clamp_dimension(options.cols, DEFAULT_COLS);
        let rows = clamp_dimension(options.rows, DEFAULT_ROWS);
        let cwd = resolve_cwd(
            options.cwd.as_deref(),
            options.project_path.as_deref(),
            dirs::home_dir(),
        );
        let program = options.shell.clone().unwrap_or_else(default_shell);

        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
            ("TERMHOST_TERMINAL_ID".to_string(), id.to_string()),
        ];
        env.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let command = SpawnCommand {
            program: program.clone(),
            args: options.args.clone(),
            cwd: cwd.clone(),
            env,
            cols,
            rows,
        };
        let pty = PtyHandle::spawn(&command)?;

        let title = options.title.clone().unwrap_or_else(|| {
            program
                .rsplit('/')
                .next()
                .unwrap_or(program.as_str())
                .to_string()
        });
        let mut info = SessionInfo::new(options.kind, cwd, title, self.history_lines);
        info.project_id = options.project_id.clone();
        info.worktree_id = options.worktree_id.clone();
        info.analysis_enabled = options.analysis_enabled;
        info.cols = cols;
        info.rows = rows;

        let generation = self.next_generation;
        self.next_generation += 1;
        let mut session = Session::new(id.to_string(), generation, pty, info);
        let reader = match session.take_pty_reader() {
            Some(reader) => reader,
            None => {
                let _ = session.kill();
                return Err(RegistryError::ReaderUnavailable(id.to_string()));
            }
        };
        let spawned = SpawnedSession {
            id: id.to_string(),
            generation,
            kind: options.kind,
            reader,
            info: session.shared_info(),
            gate: Arc::clone(session.gate()),
        };
        self.sessions.insert(id.to_string(), session);

        log::info!(
            "spawned terminal {id} ({}, {cols}x{rows}) running {program}",
            options.kind.as_str()
        );
        Ok(spawned)
    }

    /// Forward input to a session. Unknown ids are a logged no-op.
    pub fn write(&mut self, id: &str, data: &[u8]) -> Result<(), RegistryError> {
        match self.sessions.get_mut(id) {
            Some(session) => Ok(session.write_input(data)?),
            None => {
                log::warn!("write to unknown terminal {id} ignored");
                Ok(())
            }
        }
    }

    /// Resize a session, clamping both dimensions into range.
    ///
    /// Returns the applied size, or `None` for an unknown id.
    pub fn resize(
        &mut self,
        id: &str,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<Option<(u16, u16)>, RegistryError> {
        let Some(session) = self.sessions.get_mut(id) else {
            log::warn!("resize of unknown terminal {id} ignored");
            return Ok(None);
        };
        let (current_cols, current_rows) = {
            let info = session.info();
            (info.cols, info.rows)
        };
        let cols = clamp_dimension(cols, current_cols);
        let rows = clamp_dimension(rows, current_rows);
        session.resize(cols, rows)?;
        Ok(Some((cols, rows)))
    }

    /// Kill a session's process and remove it.
    ///
    /// Waits briefly for the exit code; `exit_code` is `None` only if the
    /// process has not been reaped by then.
    pub fn kill(&mut self, id: &str) -> Option<ExitedSession> {
        let mut session = self.sessions.remove(id)?;
        if let Err(e) = session.kill() {
            log::warn!("failed to kill terminal {id}: {e}");
        }
        // Wake a reader parked on the gate so it can observe EOF and exit.
        session.gate().release_all();
        let exit_code = session.wait_exit(KILL_EXIT_WAIT);
        let kind = session.info().kind;
        Some(ExitedSession {
            id: id.to_string(),
            kind,
            exit_code,
        })
    }

    /// Kill every session.
    pub fn kill_all(&mut self) -> Vec<ExitedSession> {
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.iter().filter_map(|id| self.kill(id)).collect()
    }

    /// Exit code of a session whose process has ended, without removing it.
    pub fn exit_status(&mut self, id: &str) -> Option<u32> {
        self.sessions.get_mut(id)?.exit_code()
    }

    /// Remove a session whose process ended on its own.
    pub fn remove_exited(&mut self, id: &str) -> Option<ExitedSession> {
        let mut session = self.sessions.remove(id)?;
        session.gate().release_all();
        let exit_code = session.exit_code();
        session.info().lifecycle = Lifecycle::Dead;
        let kind = session.info().kind;
        Some(ExitedSession {
            id: id.to_string(),
            kind,
            exit_code,
        })
    }

    /// Soft-delete a session. The process keeps running until `ttl` passes.
    ///
    /// Returns the expiry timestamp (ms), or `None` for an unknown id.
    pub fn trash(&mut self, id: &str, ttl: Duration) -> Option<i64> {
        let session = self.sessions.get(id)?;
        let expires_at = now_ms() + ttl.as_millis() as i64;
        session.info().lifecycle = Lifecycle::Trashed { expires_at };
        log::info!("trashed terminal {id} until {expires_at}");
        Some(expires_at)
    }

    /// Undo a trash. `false` if the session was never trashed or expired.
    pub fn restore(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        let mut info = session.info();
        match info.lifecycle {
            Lifecycle::Trashed { expires_at } if now_ms() < expires_at => {
                info.lifecycle = Lifecycle::Live;
                log::info!("restored terminal {id}");
                true
            }
            _ => false,
        }
    }

    /// Ids of trashed sessions whose expiry is at or before `now`.
    pub fn expired_trash(&self, now: i64) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| {
                matches!(s.info().lifecycle, Lifecycle::Trashed { expires_at } if expires_at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Option<TerminalSnapshot> {
        self.sessions.get(id).map(|s| s.info().snapshot(id))
    }

    /// Snapshots of every session, oldest first.
    pub fn all_snapshots(&self) -> Vec<TerminalSnapshot> {
        let mut snapshots: Vec<TerminalSnapshot> = self
            .sessions
            .iter()
            .map(|(id, s)| s.info().snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn diagnostics(&mut self, id: &str) -> Option<TerminalDiagnostics> {
        self.sessions.get_mut(id).map(Session::diagnostics)
    }

    pub fn mark_checked(&mut self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(session) => {
                session.info().last_checked_at = Some(now_ms());
                true
            }
            None => false,
        }
    }

    /// Relay a transition request to the state machine.
    ///
    /// A request carrying a `spawned_at` that differs from the session's is
    /// about a previous process under the same id and is rejected.
    pub fn transition_state(
        &mut self,
        id: &str,
        event: AgentEvent,
        trigger: StateTrigger,
        confidence: f64,
        spawned_at: Option<i64>,
    ) -> Option<StateTransition> {
        let session = self.sessions.get(id)?;
        let mut info = session.info();
        if spawned_at.is_some_and(|at| at != info.spawned_at) {
            log::debug!("stale transition request for terminal {id} ignored");
            return None;
        }

        let previous = info.agent_state;
        let state = self
            .machine
            .transition(id, previous, event, trigger, confidence)?;
        let timestamp = now_ms();
        info.agent_state = state;
        info.last_state_change = Some(timestamp);
        Some(StateTransition {
            previous,
            state,
            trigger,
            confidence,
            timestamp,
        })
    }

    pub fn terminals_for_project(&self, project_id: &str) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.info().project_id.as_deref() == Some(project_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The last `max_lines` lines of a session's output.
    pub fn history(&self, id: &str, max_lines: usize) -> Option<Vec<String>> {
        self.sessions
            .get(id)
            .map(|s| s.info().history.tail(max_lines))
    }

    /// A session's buffered output as terminal text.
    pub fn serialized_state(&self, id: &str) -> Option<String> {
        self.sessions.get(id).map(|s| s.info().history.serialize())
    }

    pub fn set_analysis_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.sessions.get(id) {
            Some(session) => {
                session.info().analysis_enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Credit `bytes` of fallback output as consumed by the UI.
    ///
    /// Returns the bytes still unacknowledged, or `None` for an unknown id.
    pub fn acknowledge_data(&self, id: &str, bytes: u64) -> Option<u64> {
        let session = self.sessions.get(id)?;
        let mut info = session.info();
        info.unacked_bytes = info.unacked_bytes.saturating_sub(bytes);
        Some(info.unacked_bytes)
    }

    pub fn set_detected_agent(&self, id: &str, agent: Option<TerminalKind>) {
        if let Some(session) = self.sessions.get(id) {
            session.info().detected_agent = agent;
        }
    }

    /// Hold a session paused on behalf of `holder`. `true` if newly held.
    pub fn pause(&self, id: &str, holder: PauseHolder) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.gate().hold(holder))
    }

    /// Release `holder`'s pause. Safe to call when not held.
    pub fn resume(&self, id: &str, holder: PauseHolder) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.gate().release(holder))
    }

    /// Release every pause on a session.
    pub fn resume_all_holders(&self, id: &str) -> Vec<PauseHolder> {
        self.sessions
            .get(id)
            .map(|s| s.gate().release_all())
            .unwrap_or_default()
    }

    /// Hold every session on behalf of `holder`, returning all session ids.
    pub fn pause_all(&self, holder: PauseHolder) -> Vec<SessionId> {
        for session in self.sessions.values() {
            session.gate().hold(holder);
        }
        self.list_sessions()
    }

    pub fn holders(&self, id: &str) -> Option<Vec<PauseHolder>> {
        self.sessions.get(id).map(|s| s.gate().holders())
    }

    /// Drop old history on every session down to `keep` lines.
    pub fn trim_history(&self, keep: usize) {
        for session in self.sessions.values() {
            session.info().history.trim_to(keep);
        }
    }

    /// `(id, pid)` of every session whose process id is known.
    pub fn process_ids(&self) -> Vec<(SessionId, u32)> {
        self.sessions
            .iter()
            .filter_map(|(id, s)| s.process_id().map(|pid| (id.clone(), pid)))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Generation of the process currently registered under `id`.
    pub fn generation(&self, id: &str) -> Option<u64> {
        self.sessions.get(id).map(Session::generation)
    }

    /// List all session IDs.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
