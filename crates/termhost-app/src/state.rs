//! Host state shared between the control loop, reader threads, and background tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use termhost_pty::{PauseHolder, Registry, SessionId};
use termhost_shm::DataChannels;

use crate::backpressure::BackpressureController;
use crate::bus::EventBus;
use crate::config::HostConfig;
use crate::governor::GovernorState;
use crate::io_thread::{ReaderExit, ReaderSignal};
use crate::ipc::EventSink;

/// Everything the host shares across tasks and threads.
pub struct HostState {
    pub config: HostConfig,
    registry: Mutex<Registry>,
    pub channels: Arc<DataChannels>,
    pub sink: EventSink,
    pub bus: EventBus,
    pub controller: BackpressureController,
    throttle: Mutex<GovernorState>,
    /// Signal channels to each session's reader thread.
    readers: Mutex<HashMap<SessionId, mpsc::UnboundedSender<ReaderSignal>>>,
    /// Reader threads report PTY EOF here.
    pub exits: mpsc::UnboundedSender<ReaderExit>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostState {
    pub fn new(
        config: HostConfig,
        sink: EventSink,
        bus: EventBus,
        exits: mpsc::UnboundedSender<ReaderExit>,
        runtime: Handle,
    ) -> Self {
        let channels = Arc::new(DataChannels::new());
        let controller = BackpressureController::new(
            config.backpressure.clone(),
            Arc::clone(&channels),
            sink.clone(),
            runtime,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Mutex::new(Registry::new(config.sessions.history_lines)),
            config,
            channels,
            sink,
            bus,
            controller,
            throttle: Mutex::new(GovernorState::default()),
            readers: Mutex::new(HashMap::new()),
            exits,
            shutdown,
        }
    }

    /// Lock the registry. Never hold the guard across an `.await`.
    pub fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    pub fn throttle(&self) -> MutexGuard<'_, GovernorState> {
        lock(&self.throttle)
    }

    pub fn is_throttling(&self) -> bool {
        self.throttle().is_throttling()
    }

    pub fn add_reader(&self, id: &str, signals: mpsc::UnboundedSender<ReaderSignal>) {
        lock(&self.readers).insert(id.to_string(), signals);
    }

    /// Send a signal to a session's reader. `false` if it has no reader.
    pub fn signal_reader(&self, id: &str, signal: ReaderSignal) -> bool {
        lock(&self.readers)
            .get(id)
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    /// Forget a session's reader, telling it to stop.
    pub fn remove_reader(&self, id: &str) {
        if let Some(tx) = lock(&self.readers).remove(id) {
            let _ = tx.send(ReaderSignal::Stop);
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Release `holder` on every session, one at a time, `stagger` apart.
pub async fn release_staggered(host: &Arc<HostState>, holder: PauseHolder, stagger: std::time::Duration) {
    let ids = host.registry().list_sessions();
    let mut released = 0usize;
    for id in ids {
        let was_held = host.registry().resume(&id, holder);
        if !was_held {
            continue;
        }
        host.controller.refresh(&id);
        released += 1;
        if !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }
    }
    if released > 0 {
        log::info!("released {released} sessions held by {holder:?}");
    }
}
