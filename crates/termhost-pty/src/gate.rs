//! Per-session pause gate.
//!
//! A session is paused by holding its gate: the reader thread stops draining
//! the PTY master, the kernel buffer fills, and the child blocks on its next
//! write. Each mechanism that pauses a session takes its own hold, so one
//! mechanism's resume never cancels another's pause.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Who is holding a session paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseHolder {
    /// The visual ring was full.
    Backpressure,
    /// Host memory pressure.
    Governor,
    /// An explicit pause-all from the owning process (e.g. system sleep).
    System,
    /// Too much fallback output is waiting for the consumer's acknowledgement.
    Acknowledgement,
}

#[derive(Debug, Default)]
pub struct PauseGate {
    holders: Mutex<BTreeSet<PauseHolder>>,
    opened: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<PauseHolder>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a hold. Returns `true` if `holder` did not already hold the gate.
    pub fn hold(&self, holder: PauseHolder) -> bool {
        self.lock().insert(holder)
    }

    /// Drop a hold. Returns `true` if `holder` was holding the gate.
    ///
    /// Releasing a hold that is not held does nothing.
    pub fn release(&self, holder: PauseHolder) -> bool {
        let mut holders = self.lock();
        let was_held = holders.remove(&holder);
        if holders.is_empty() {
            self.opened.notify_all();
        }
        was_held
    }

    /// Drop every hold, returning the holders that were released.
    pub fn release_all(&self) -> Vec<PauseHolder> {
        let mut holders = self.lock();
        let released: Vec<PauseHolder> = std::mem::take(&mut *holders).into_iter().collect();
        self.opened.notify_all();
        released
    }

    pub fn is_paused(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn is_held_by(&self, holder: PauseHolder) -> bool {
        self.lock().contains(&holder)
    }

    pub fn holders(&self) -> Vec<PauseHolder> {
        self.lock().iter().copied().collect()
    }

    /// Block until the gate is open or `timeout` elapses.
    ///
    /// Returns `true` if the gate is open. Callers loop so they can observe
    /// their own stop signal between waits.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let holders = self.lock();
        let (holders, _) = self
            .opened
            .wait_timeout_while(holders, timeout, |holders| !holders.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        holders.is_empty()
    }
}
