//! Per-session backpressure controller.
//!
//! When the visual ring has no room for a session's next frame, the session
//! is held paused with [`PauseHolder::Backpressure`] and a monitor task polls
//! the ring until the ring goes away, the pause hits its ceiling, or the ring
//! drains below the resume threshold with room for the refused frame. Status
//! changes are reported as `terminal-status` events, never twice in a row
//! with the same value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use termhost_pty::{PauseGate, PauseHolder, SessionId};
use termhost_shm::{Channel, DataChannels};

use crate::config::BackpressureConfig;
use crate::ipc::{EventSink, FlowStatus, HostEvent};

/// Why a backpressure pause ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    /// The visual ring was detached or replaced.
    RingGone,
    /// The pause reached its ceiling.
    Timeout,
    /// The ring drained below the resume threshold.
    Drained,
    /// The reader sent the refused frame over the fallback.
    Flushed,
}

impl ResumeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeReason::RingGone => "ring gone",
            ResumeReason::Timeout => "timeout",
            ResumeReason::Drained => "drained",
            ResumeReason::Flushed => "flushed",
        }
    }
}

struct FlowRecord {
    gate: Arc<PauseGate>,
    last_status: FlowStatus,
    pause_started_at: Option<Instant>,
    /// Size of the refused frame; the ring must have this much room to resume.
    needed: usize,
    /// Stop signal for the running monitor; `None` when no monitor runs.
    monitor: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: BackpressureConfig,
    channels: Arc<DataChannels>,
    sink: EventSink,
    runtime: Handle,
    records: Mutex<HashMap<SessionId, FlowRecord>>,
}

#[derive(Clone)]
pub struct BackpressureController {
    inner: Arc<Inner>,
}

/// The status a session's holders imply.
///
/// Governor holds are reported through `host-throttled`, not per terminal.
/// A backlog of unacknowledged fallback output is consumer backpressure too.
fn derive_status(gate: &PauseGate) -> FlowStatus {
    if gate.is_held_by(PauseHolder::Backpressure) || gate.is_held_by(PauseHolder::Acknowledgement) {
        FlowStatus::PausedBackpressure
    } else if gate.is_held_by(PauseHolder::System) {
        FlowStatus::Suspended
    } else {
        FlowStatus::Running
    }
}

impl BackpressureController {
    pub fn new(
        config: BackpressureConfig,
        channels: Arc<DataChannels>,
        sink: EventSink,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                channels,
                sink,
                runtime,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SessionId, FlowRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a session. Its status starts as `running`.
    pub fn register(&self, id: &str, gate: Arc<PauseGate>) {
        let record = FlowRecord {
            last_status: derive_status(&gate),
            gate,
            pause_started_at: None,
            needed: 0,
            monitor: None,
        };
        self.records().insert(id.to_string(), record);
    }

    /// Stop tracking a session, ending its monitor if one runs.
    pub fn unregister(&self, id: &str) {
        if let Some(mut record) = self.records().remove(id) {
            if let Some(stop) = record.monitor.take() {
                let _ = stop.send(());
            }
        }
    }

    /// The visual ring refused a `needed`-byte frame for `id`.
    ///
    /// Holds the session paused (once) and makes sure a monitor is running.
    pub fn on_buffer_full(&self, id: &str, needed: usize) {
        let mut records = self.records();
        let Some(record) = records.get_mut(id) else {
            log::debug!("buffer full for untracked terminal {id}");
            return;
        };

        record.needed = needed;
        if record.gate.hold(PauseHolder::Backpressure) {
            record.pause_started_at = Some(Instant::now());
            log::debug!("terminal {id} paused: visual ring full");
        }
        if record.monitor.is_none() {
            record.monitor = Some(self.spawn_monitor(id.to_string()));
        }
        self.emit_status(id, record, None);
    }

    /// Release the backpressure hold on `id`. Returns `true` if it was held.
    pub fn resume(&self, id: &str, reason: ResumeReason) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if let Some(stop) = record.monitor.take() {
            let _ = stop.send(());
        }

        let released = record.gate.release(PauseHolder::Backpressure);
        let paused_for = record.pause_started_at.take().map(|at| at.elapsed());
        if released {
            log::debug!(
                "terminal {id} resumed ({}) after {}ms",
                reason.as_str(),
                paused_for.unwrap_or_default().as_millis()
            );
        }
        self.emit_status(id, record, paused_for);
        released
    }

    /// Release every hold on `id`, whoever took it.
    pub fn force_resume(&self, id: &str) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if let Some(stop) = record.monitor.take() {
            let _ = stop.send(());
        }

        let released = record.gate.release_all();
        let paused_for = record.pause_started_at.take().map(|at| at.elapsed());
        if !released.is_empty() {
            log::info!("terminal {id} force-resumed, released {released:?}");
        }
        self.emit_status(id, record, paused_for);
        !released.is_empty()
    }

    /// Re-derive and report `id`'s status after another mechanism changed
    /// its holders.
    pub fn refresh(&self, id: &str) {
        let mut records = self.records();
        if let Some(record) = records.get_mut(id) {
            self.emit_status(id, record, None);
        }
    }

    pub fn status(&self, id: &str) -> Option<FlowStatus> {
        self.records().get(id).map(|r| r.last_status)
    }

    #[cfg(test)]
    pub fn is_monitoring(&self, id: &str) -> bool {
        self.records()
            .get(id)
            .is_some_and(|r| r.monitor.is_some())
    }

    /// End every monitor. Holds are left as they are.
    pub fn shutdown(&self) {
        for record in self.records().values_mut() {
            if let Some(stop) = record.monitor.take() {
                let _ = stop.send(());
            }
        }
    }

    fn emit_status(&self, id: &str, record: &mut FlowRecord, paused_for: Option<Duration>) {
        let status = derive_status(&record.gate);
        if status == record.last_status {
            return;
        }
        record.last_status = status;
        self.inner.sink.emit(HostEvent::TerminalStatus {
            id: id.to_string(),
            status,
            pause_duration_ms: paused_for.map(|d| d.as_millis() as u64),
        });
    }

    /// Decide whether `id` should resume now.
    fn check(&self, id: &str) -> Option<ResumeReason> {
        let (started, needed) = {
            let records = self.records();
            let record = records.get(id)?;
            (record.pause_started_at?, record.needed)
        };
        let Some(ring) = self.inner.channels.get(Channel::Visual) else {
            return Some(ResumeReason::RingGone);
        };
        if started.elapsed() >= self.inner.config.max_pause() {
            return Some(ResumeReason::Timeout);
        }
        if ring.utilization() < self.inner.config.resume_threshold_percent
            && ring.free_space() >= needed
        {
            return Some(ResumeReason::Drained);
        }
        None
    }

    fn spawn_monitor(&self, id: SessionId) -> oneshot::Sender<()> {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let controller = self.clone();
        let poll = self.inner.config.poll_interval();

        self.inner.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + poll, poll);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut stop_rx => return,
                }
                if let Some(reason) = controller.check(&id) {
                    controller.resume(&id, reason);
                    return;
                }
            }
        });
        stop_tx
    }
}
