use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::gate::{PauseGate, PauseHolder};
use crate::pty::{PtyError, PtyHandle};

/// Opaque identifier for a terminal session, supplied by the caller or
/// generated by the host.
pub type SessionId = String;

/// Smallest and largest accepted terminal dimension.
pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 500;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Clamp a requested dimension into `[MIN_DIMENSION, MAX_DIMENSION]`.
///
/// Missing or non-finite values keep `current`; fractional values are floored.
pub fn clamp_dimension(value: Option<f64>, current: u16) -> u16 {
    match value {
        Some(v) if v.is_finite() => {
            v.floor()
                .clamp(MIN_DIMENSION as f64, MAX_DIMENSION as f64) as u16
        }
        _ => current.clamp(MIN_DIMENSION, MAX_DIMENSION),
    }
}

/// What runs inside a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    #[default]
    Shell,
    Claude,
    Gemini,
    Codex,
    Opencode,
}

impl TerminalKind {
    pub fn is_agent(self) -> bool {
        !matches!(self, TerminalKind::Shell)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalKind::Shell => "shell",
            TerminalKind::Claude => "claude",
            TerminalKind::Gemini => "gemini",
            TerminalKind::Codex => "codex",
            TerminalKind::Opencode => "opencode",
        }
    }

    /// Map a process name (as reported by the OS) to an agent kind.
    pub fn from_process_name(name: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let base = base.strip_suffix(".exe").unwrap_or(base);
        match base {
            "claude" => Some(TerminalKind::Claude),
            "gemini" => Some(TerminalKind::Gemini),
            "codex" => Some(TerminalKind::Codex),
            "opencode" => Some(TerminalKind::Opencode),
            _ => None,
        }
    }
}

/// Agent state as recorded by the host. Classification happens elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Busy,
    Waiting,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Lifecycle {
    Live,
    Trashed {
        #[serde(rename = "expiresAt")]
        expires_at: i64,
    },
    Dead,
}

/// Bounded line history of a session's output, used for replay.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    max_lines: usize,
}

impl HistoryBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: Vec::new(),
            max_lines,
        }
    }

    /// Append raw output. Lines are split on `\n`; a trailing `\r` is dropped.
    pub fn push(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.lines.push_back(line);
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        self.trim_to(self.max_lines);
    }

    /// Drop the oldest lines until at most `keep` remain.
    pub fn trim_to(&mut self, keep: usize) {
        while self.lines.len() > keep {
            self.lines.pop_front();
        }
    }

    /// Number of complete lines held.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    /// The last `max` lines, followed by the unterminated line if any.
    pub fn tail(&self, max: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(max);
        let mut out: Vec<String> = self.lines.iter().skip(skip).cloned().collect();
        if !self.partial.is_empty() {
            out.push(String::from_utf8_lossy(&self.partial).into_owned());
        }
        out
    }

    /// Whole history as terminal text.
    pub fn serialize(&self) -> String {
        let mut text = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\r\n");
        if !self.lines.is_empty() {
            text.push_str("\r\n");
        }
        text.push_str(&String::from_utf8_lossy(&self.partial));
        text
    }
}

/// Mutable session metadata, shared between the registry and the session's
/// reader thread.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub kind: TerminalKind,
    pub cwd: PathBuf,
    pub title: String,
    pub project_id: Option<String>,
    pub worktree_id: Option<String>,
    pub analysis_enabled: bool,
    pub agent_state: AgentState,
    pub last_state_change: Option<i64>,
    pub spawned_at: i64,
    pub history: HistoryBuffer,
    pub last_input_at: Option<i64>,
    pub last_output_at: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub lifecycle: Lifecycle,
    pub cols: u16,
    pub rows: u16,
    pub detected_agent: Option<TerminalKind>,
    /// Bytes sent over the message fallback and not yet acknowledged.
    pub unacked_bytes: u64,
    pub analysis_frames_dropped: u64,
    pub exit_code: Option<u32>,
}

impl SessionInfo {
    pub fn new(kind: TerminalKind, cwd: PathBuf, title: String, history_lines: usize) -> Self {
        Self {
            kind,
            cwd,
            title,
            project_id: None,
            worktree_id: None,
            analysis_enabled: false,
            agent_state: AgentState::Idle,
            last_state_change: None,
            spawned_at: now_ms(),
            history: HistoryBuffer::new(history_lines),
            last_input_at: None,
            last_output_at: None,
            last_checked_at: None,
            lifecycle: Lifecycle::Live,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            detected_agent: None,
            unacked_bytes: 0,
            analysis_frames_dropped: 0,
            exit_code: None,
        }
    }

    /// Record output that arrived from the PTY.
    pub fn record_output(&mut self, bytes: &[u8]) {
        self.last_output_at = Some(now_ms());
        self.history.push(bytes);
    }

    pub fn snapshot(&self, id: &str) -> TerminalSnapshot {
        TerminalSnapshot {
            id: id.to_string(),
            kind: self.kind,
            cwd: self.cwd.to_string_lossy().into_owned(),
            title: self.title.clone(),
            project_id: self.project_id.clone(),
            worktree_id: self.worktree_id.clone(),
            analysis_enabled: self.analysis_enabled,
            agent_state: self.agent_state,
            last_state_change: self.last_state_change,
            spawned_at: self.spawned_at,
            last_input_at: self.last_input_at,
            last_output_at: self.last_output_at,
            last_checked_at: self.last_checked_at,
            lifecycle: self.lifecycle,
            cols: self.cols,
            rows: self.rows,
            detected_agent: self.detected_agent,
        }
    }
}

/// Sanitized view of a session for display. Carries no process handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSnapshot {
    pub id: SessionId,
    #[serde(rename = "type")]
    pub kind: TerminalKind,
    pub cwd: String,
    pub title: String,
    pub project_id: Option<String>,
    pub worktree_id: Option<String>,
    pub analysis_enabled: bool,
    pub agent_state: AgentState,
    pub last_state_change: Option<i64>,
    pub spawned_at: i64,
    pub last_input_at: Option<i64>,
    pub last_output_at: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub lifecycle: Lifecycle,
    pub cols: u16,
    pub rows: u16,
    pub detected_agent: Option<TerminalKind>,
}

/// Low-level session state for troubleshooting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDiagnostics {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub alive: bool,
    pub pause_holders: Vec<PauseHolder>,
    pub history_lines: usize,
    pub unacked_bytes: u64,
    pub analysis_frames_dropped: u64,
    pub lifecycle: Lifecycle,
}

/// A live terminal session: the PTY process, its shared metadata, and its
/// pause gate.
pub struct Session {
    id: SessionId,
    generation: u64,
    pty: PtyHandle,
    info: Arc<Mutex<SessionInfo>>,
    gate: Arc<PauseGate>,
}

impl Session {
    pub fn new(id: SessionId, generation: u64, pty: PtyHandle, info: SessionInfo) -> Self {
        Self {
            id,
            generation,
            pty,
            info: Arc::new(Mutex::new(info)),
            gate: Arc::new(PauseGate::new()),
        }
    }

    /// Returns the session's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Distinguishes this process from earlier ones spawned under the same id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lock the shared metadata. A poisoned lock is recovered; the data is
    /// plain bookkeeping.
    pub fn info(&self) -> MutexGuard<'_, SessionInfo> {
        lock_info(&self.info)
    }

    pub fn shared_info(&self) -> Arc<Mutex<SessionInfo>> {
        Arc::clone(&self.info)
    }

    pub fn gate(&self) -> &Arc<PauseGate> {
        &self.gate
    }

    /// Extract the PTY reader for the session's I/O thread.
    pub fn take_pty_reader(&mut self) -> Option<Box<dyn std::io::Read + Send>> {
        self.pty.take_reader()
    }

    /// Write user input to the PTY.
    pub fn write_input(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.pty.write(data)?;
        self.info().last_input_at = Some(now_ms());
        Ok(())
    }

    /// Resize the PTY and record the new dimensions.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.pty.resize(cols, rows)?;
        let mut info = self.info();
        info.cols = cols;
        info.rows = rows;
        Ok(())
    }

    pub fn process_id(&self) -> Option<u32> {
        self.pty.process_id()
    }

    /// Check if the session's process is still alive.
    pub fn is_alive(&mut self) -> bool {
        self.exit_code().is_none()
    }

    /// Exit code if the process has exited.
    pub fn exit_code(&mut self) -> Option<u32> {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        if info.exit_code.is_none() {
            if let Some(code) = self.pty.try_wait() {
                info.exit_code = Some(code);
                info.lifecycle = Lifecycle::Dead;
            }
        }
        info.exit_code
    }

    /// Poll for the exit code for up to `timeout`.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.exit_code() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Terminate the process.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        self.pty.kill()?;
        self.info().lifecycle = Lifecycle::Dead;
        Ok(())
    }

    pub fn diagnostics(&mut self) -> TerminalDiagnostics {
        let alive = self.is_alive();
        let pid = self.process_id();
        let pause_holders = self.gate.holders();
        let info = self.info();
        TerminalDiagnostics {
            id: self.id.clone(),
            pid,
            alive,
            pause_holders,
            history_lines: info.history.len(),
            unacked_bytes: info.unacked_bytes,
            analysis_frames_dropped: info.analysis_frames_dropped,
            lifecycle: info.lifecycle,
        }
    }
}

/// Lock shared session metadata, recovering from poisoning.
pub fn lock_info(info: &Mutex<SessionInfo>) -> MutexGuard<'_, SessionInfo> {
    info.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_dimension() {
        assert_eq!(clamp_dimension(Some(-5.0), 80), 1);
        assert_eq!(clamp_dimension(Some(0.0), 80), 1);
        assert_eq!(clamp_dimension(Some(120.7), 80), 120);
        assert_eq!(clamp_dimension(Some(10_000.0), 80), 500);
        assert_eq!(clamp_dimension(Some(f64::NAN), 30), 30);
        assert_eq!(clamp_dimension(Some(f64::INFINITY), 30), 30);
        assert_eq!(clamp_dimension(None, 24), 24);
    }

    #[test]
    fn test_kind_defaults_to_shell() {
        assert_eq!(TerminalKind::default(), TerminalKind::Shell);
        assert!(!TerminalKind::Shell.is_agent());
        assert!(TerminalKind::Claude.is_agent());
    }

    #[test]
    fn test_kind_from_process_name() {
        assert_eq!(
            TerminalKind::from_process_name("/usr/local/bin/claude"),
            Some(TerminalKind::Claude)
        );
        assert_eq!(TerminalKind::from_process_name("codex.exe"), Some(TerminalKind::Codex));
        assert_eq!(TerminalKind::from_process_name("zsh"), None);
    }

    #[test]
    fn test_history_splits_lines() {
        let mut history = HistoryBuffer::new(100);
        history.push(b"one\r\ntwo\npar");
        history.push(b"tial\r\n");
        assert_eq!(history.len(), 3);
        assert_eq!(history.tail(10), vec!["one", "two", "partial"]);
    }

    #[test]
    fn test_history_keeps_partial_line() {
        let mut history = HistoryBuffer::new(100);
        history.push(b"$ prompt");
        assert_eq!(history.len(), 0);
        assert!(!history.is_empty());
        assert_eq!(history.tail(5), vec!["$ prompt"]);
        assert_eq!(history.serialize(), "$ prompt");
    }

    #[test]
    fn test_history_bounded() {
        let mut history = HistoryBuffer::new(3);
        for i in 0..10 {
            history.push(format!("line {i}\n").as_bytes());
        }
        assert_eq!(history.tail(10), vec!["line 7", "line 8", "line 9"]);

        history.trim_to(1);
        assert_eq!(history.tail(10), vec!["line 9"]);
    }

    #[test]
    fn test_history_multibyte_across_chunks() {
        let mut history = HistoryBuffer::new(10);
        let text = "héllo\n".as_bytes();
        history.push(&text[..2]);
        history.push(&text[2..]);
        assert_eq!(history.tail(1), vec!["héllo"]);
    }

    #[test]
    fn test_history_serialize() {
        let mut history = HistoryBuffer::new(10);
        history.push(b"a\nb\n$ ");
        assert_eq!(history.serialize(), "a\r\nb\r\n$ ");
    }

    #[test]
    fn test_snapshot_serialization() {
        let info = SessionInfo::new(
            TerminalKind::Shell,
            PathBuf::from("/tmp"),
            "sh".to_string(),
            10,
        );
        let json = serde_json::to_value(info.snapshot("t1")).unwrap();
        assert_eq!(json["id"], "t1");
        assert_eq!(json["type"], "shell");
        assert_eq!(json["agentState"], "idle");
        assert_eq!(json["lifecycle"]["state"], "live");
        assert!(json.get("pid").is_none());
    }

    #[test]
    fn test_trashed_lifecycle_serialization() {
        let json = serde_json::to_value(Lifecycle::Trashed { expires_at: 42 }).unwrap();
        assert_eq!(json["state"], "trashed");
        assert_eq!(json["expiresAt"], 42);
    }
}
