//! termhost-pty: PTY ownership and terminal session lifecycle for termhost.
//!
//! This crate owns every shell/agent process the host runs. Nothing outside
//! the [`Registry`] touches a process handle; other components address
//! sessions by their string id.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: Low-level PTY process management (spawn, write, resize, kill).
//! - [`PauseGate`]: Records which mechanisms currently hold a session's output paused.
//! - [`Session`]: Pairs a `PtyHandle` with shared metadata and its pause gate.
//! - [`Registry`]: Arena of sessions keyed by id: spawn/write/resize/kill/trash/restore,
//!   snapshots, and relaying agent state transitions to an [`AgentStateMachine`].

pub mod cwd;
pub mod gate;
pub mod pty;
pub mod registry;
pub mod session;
pub mod state_machine;

pub use gate::{PauseGate, PauseHolder};
pub use pty::{PtyError, PtyHandle, SpawnCommand};
pub use registry::{ExitedSession, Registry, RegistryError, SpawnOptions, SpawnedSession};
pub use session::{
    AgentState, HistoryBuffer, Lifecycle, Session, SessionId, SessionInfo, TerminalDiagnostics,
    TerminalKind, TerminalSnapshot,
};
pub use state_machine::{
    AgentEvent, AgentStateMachine, DefaultStateMachine, StateTransition, StateTrigger,
};
