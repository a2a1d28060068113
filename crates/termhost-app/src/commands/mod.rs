//! Handlers for control messages, grouped by concern.
//!
//! Handlers are synchronous so the dispatcher can isolate a panicking one;
//! anything that has to wait is spawned onto the runtime.

pub mod flow;
pub mod query;
pub mod terminal;

use thiserror::Error;

use termhost_pty::{RegistryError, SessionId};
use termhost_shm::RingError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown terminal {0}")]
    UnknownTerminal(SessionId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to start reader thread: {0}")]
    Reader(#[source] std::io::Error),
    #[error(transparent)]
    Ring(#[from] RingError),
}
