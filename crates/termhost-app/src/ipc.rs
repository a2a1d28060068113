//! Control protocol between the owning process and the host.
//!
//! Both directions are newline-delimited JSON objects tagged by `type`.
//! Inbound messages arrive on stdin as [`ControlMessage`]; everything the host
//! says goes through an [`EventSink`] as a [`HostEvent`] and is written to
//! stdout, except fallback `data` events, which go to the data port while
//! one is connected.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as B64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use termhost_pty::{
    AgentEvent, AgentState, SessionId, SpawnOptions, StateTransition, StateTrigger,
    TerminalDiagnostics, TerminalKind, TerminalSnapshot,
};

/// Messages received from the owning process.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Spawn {
        #[serde(default)]
        id: Option<SessionId>,
        #[serde(default)]
        options: SpawnOptions,
    },
    Write {
        id: SessionId,
        data: String,
    },
    Resize {
        id: SessionId,
        #[serde(default)]
        cols: Option<f64>,
        #[serde(default)]
        rows: Option<f64>,
    },
    Kill {
        id: SessionId,
        #[serde(default)]
        reason: Option<String>,
    },
    Trash {
        id: SessionId,
    },
    Restore {
        id: SessionId,
    },
    FlushBuffer {
        id: SessionId,
    },
    AcknowledgeData {
        id: SessionId,
        bytes: u64,
    },
    SetAnalysisEnabled {
        id: SessionId,
        enabled: bool,
    },
    GetSnapshot {
        id: SessionId,
        #[serde(default)]
        request_id: Option<String>,
    },
    GetAllSnapshots {
        #[serde(default)]
        request_id: Option<String>,
    },
    MarkChecked {
        id: SessionId,
    },
    TransitionState {
        id: SessionId,
        event: AgentEvent,
        trigger: StateTrigger,
        confidence: f64,
        #[serde(default)]
        spawned_at: Option<i64>,
        #[serde(default)]
        request_id: Option<String>,
    },
    HealthCheck {
        #[serde(default)]
        request_id: Option<String>,
    },
    PauseAll,
    ResumeAll,
    GetTerminalsForProject {
        project_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    GetTerminal {
        id: SessionId,
        #[serde(default)]
        request_id: Option<String>,
    },
    ReplayHistory {
        id: SessionId,
        #[serde(default)]
        max_lines: Option<usize>,
        #[serde(default)]
        request_id: Option<String>,
    },
    GetSerializedState {
        id: SessionId,
        #[serde(default)]
        request_id: Option<String>,
    },
    GetTerminalInfo {
        id: SessionId,
        #[serde(default)]
        request_id: Option<String>,
    },
    ForceResume {
        id: SessionId,
    },
    Dispose,
    InitBuffers {
        #[serde(default)]
        visual_path: Option<PathBuf>,
        #[serde(default)]
        analysis_path: Option<PathBuf>,
    },
    ConnectPort {
        socket_path: PathBuf,
    },
}

impl ControlMessage {
    /// Parse one inbound line.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Spawn { .. } => "spawn",
            ControlMessage::Write { .. } => "write",
            ControlMessage::Resize { .. } => "resize",
            ControlMessage::Kill { .. } => "kill",
            ControlMessage::Trash { .. } => "trash",
            ControlMessage::Restore { .. } => "restore",
            ControlMessage::FlushBuffer { .. } => "flush-buffer",
            ControlMessage::AcknowledgeData { .. } => "acknowledge-data",
            ControlMessage::SetAnalysisEnabled { .. } => "set-analysis-enabled",
            ControlMessage::GetSnapshot { .. } => "get-snapshot",
            ControlMessage::GetAllSnapshots { .. } => "get-all-snapshots",
            ControlMessage::MarkChecked { .. } => "mark-checked",
            ControlMessage::TransitionState { .. } => "transition-state",
            ControlMessage::HealthCheck { .. } => "health-check",
            ControlMessage::PauseAll => "pause-all",
            ControlMessage::ResumeAll => "resume-all",
            ControlMessage::GetTerminalsForProject { .. } => "get-terminals-for-project",
            ControlMessage::GetTerminal { .. } => "get-terminal",
            ControlMessage::ReplayHistory { .. } => "replay-history",
            ControlMessage::GetSerializedState { .. } => "get-serialized-state",
            ControlMessage::GetTerminalInfo { .. } => "get-terminal-info",
            ControlMessage::ForceResume { .. } => "force-resume",
            ControlMessage::Dispose => "dispose",
            ControlMessage::InitBuffers { .. } => "init-buffers",
            ControlMessage::ConnectPort { .. } => "connect-port",
        }
    }

    /// Session the message targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Spawn { id, .. } => id.as_deref(),
            ControlMessage::Write { id, .. }
            | ControlMessage::Resize { id, .. }
            | ControlMessage::Kill { id, .. }
            | ControlMessage::Trash { id }
            | ControlMessage::Restore { id }
            | ControlMessage::FlushBuffer { id }
            | ControlMessage::AcknowledgeData { id, .. }
            | ControlMessage::SetAnalysisEnabled { id, .. }
            | ControlMessage::GetSnapshot { id, .. }
            | ControlMessage::MarkChecked { id }
            | ControlMessage::TransitionState { id, .. }
            | ControlMessage::GetTerminal { id, .. }
            | ControlMessage::ReplayHistory { id, .. }
            | ControlMessage::GetSerializedState { id, .. }
            | ControlMessage::GetTerminalInfo { id, .. }
            | ControlMessage::ForceResume { id } => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Per-terminal flow state reported by `terminal-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowStatus {
    Running,
    PausedBackpressure,
    /// Held by an explicit pause-all.
    Suspended,
}

/// Events sent from the host to the owning process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostEvent {
    Ready {
        pid: u32,
        version: String,
    },
    /// Fallback output, base64 encoded.
    Data {
        id: SessionId,
        data: String,
        /// Visual ring read cursor the consumer must reach before showing
        /// this chunk. Absent when nothing of this session is still unread.
        #[serde(skip_serializing_if = "Option::is_none")]
        visual_offset: Option<u64>,
    },
    Exit {
        id: SessionId,
        exit_code: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<SessionId>,
        message: String,
    },
    Snapshot {
        request_id: Option<String>,
        id: SessionId,
        snapshot: Option<TerminalSnapshot>,
    },
    AllSnapshots {
        request_id: Option<String>,
        snapshots: Vec<TerminalSnapshot>,
    },
    TransitionResult {
        request_id: Option<String>,
        id: SessionId,
        success: bool,
    },
    Pong {
        request_id: Option<String>,
        timestamp: i64,
        sessions: usize,
    },
    TerminalStatus {
        id: SessionId,
        status: FlowStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause_duration_ms: Option<u64>,
    },
    HostThrottled {
        is_throttled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage_percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    TerminalsForProject {
        request_id: Option<String>,
        project_id: String,
        ids: Vec<SessionId>,
    },
    TerminalInfo {
        request_id: Option<String>,
        id: SessionId,
        terminal: Option<TerminalSnapshot>,
    },
    ReplayHistoryResult {
        request_id: Option<String>,
        id: SessionId,
        lines: Option<Vec<String>>,
    },
    SerializedState {
        request_id: Option<String>,
        id: SessionId,
        state: Option<String>,
    },
    TerminalDiagnosticInfo {
        request_id: Option<String>,
        id: SessionId,
        info: Option<TerminalDiagnostics>,
        status: Option<FlowStatus>,
    },
    AgentState {
        id: SessionId,
        previous: AgentState,
        state: AgentState,
        trigger: StateTrigger,
        confidence: f64,
        timestamp: i64,
    },
    AgentDetected {
        id: SessionId,
        agent: TerminalKind,
    },
    AgentExited {
        id: SessionId,
        agent: TerminalKind,
    },
    AgentSpawned {
        id: SessionId,
        agent: TerminalKind,
    },
    AgentOutput {
        id: SessionId,
        timestamp: i64,
    },
    AgentCompleted {
        id: SessionId,
    },
    AgentFailed {
        id: SessionId,
    },
    AgentKilled {
        id: SessionId,
        agent: TerminalKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ArtifactDetected {
        id: SessionId,
        uri: String,
    },
    TerminalTrashed {
        id: SessionId,
        expires_at: i64,
    },
    TerminalRestored {
        id: SessionId,
    },
}

impl HostEvent {
    pub fn agent_state(id: SessionId, transition: &StateTransition) -> Self {
        HostEvent::AgentState {
            id,
            previous: transition.previous,
            state: transition.state,
            trigger: transition.trigger,
            confidence: transition.confidence,
            timestamp: transition.timestamp,
        }
    }
}

/// What the writer task consumes.
#[derive(Debug)]
pub enum Outbound {
    Event(HostEvent),
    /// Route subsequent `data` events to this stream.
    AttachPort(UnixStream),
    /// Answered once everything queued before it has been written.
    Barrier(oneshot::Sender<()>),
}

/// Cloneable handle for emitting host events from any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: HostEvent) {
        if self.tx.send(Outbound::Event(event)).is_err() {
            log::debug!("event dropped, writer has shut down");
        }
    }

    /// Send output over the message fallback, to be shown once the
    /// consumer has read the visual ring up to `after`.
    pub fn data(&self, id: &str, bytes: &[u8], after: Option<u64>) {
        self.emit(HostEvent::Data {
            id: id.to_string(),
            data: B64_STANDARD.encode(bytes),
            visual_offset: after,
        });
    }

    pub fn error(&self, id: Option<&str>, message: impl Into<String>) {
        self.emit(HostEvent::Error {
            id: id.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn attach_port(&self, stream: UnixStream) {
        if self.tx.send(Outbound::AttachPort(stream)).is_err() {
            log::debug!("data port dropped, writer has shut down");
        }
    }

    /// Wait until every event emitted so far has been written.
    pub async fn flushed(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Outbound::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn encode_line(event: &HostEvent) -> Option<Vec<u8>> {
    match serde_json::to_vec(event) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(e) => {
            log::error!("failed to serialize event: {e}");
            None
        }
    }
}

/// Drain the sink until every sender is gone, writing one JSON line per event.
///
/// Returns `out` so callers (and tests) can inspect what was written.
pub async fn run_writer<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut out: W) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    let mut port: Option<UnixStream> = None;

    while let Some(outbound) = rx.recv().await {
        let event = match outbound {
            Outbound::AttachPort(stream) => {
                log::info!("data port connected");
                port = Some(stream);
                continue;
            }
            Outbound::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            Outbound::Event(event) => event,
        };
        let Some(line) = encode_line(&event) else {
            continue;
        };

        if matches!(event, HostEvent::Data { .. }) {
            if let Some(stream) = port.as_mut() {
                match stream.write_all(&line).await {
                    Ok(()) => continue,
                    Err(e) => {
                        log::warn!("data port write failed, falling back to stdout: {e}");
                        port = None;
                    }
                }
            }
        }

        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(out)
}
