//! Flow control and data channel setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixStream;

use termhost_pty::PauseHolder;
use termhost_shm::{Channel, RingBuffer};

use crate::commands::{terminal, CommandError};
use crate::io_thread::ReaderSignal;
use crate::state::{release_staggered, HostState};

/// Send a frame parked on a full visual ring over the message fallback.
pub fn flush_buffer(host: &HostState, id: &str) {
    if !host.signal_reader(id, ReaderSignal::Flush) {
        log::debug!("flush-buffer for terminal {id} without a reader ignored");
    }
}

/// Hold every session with the system holder.
pub fn pause_all(host: &HostState) {
    let ids = host.registry().pause_all(PauseHolder::System);
    for id in &ids {
        host.controller.refresh(id);
    }
    log::info!("paused {} sessions", ids.len());
}

/// Release the system holder everywhere, staggered.
pub fn resume_all(host: &Arc<HostState>) {
    let host = Arc::clone(host);
    tokio::spawn(async move {
        let stagger = host.config.sessions.resume_stagger();
        release_staggered(&host, PauseHolder::System, stagger).await;
    });
}

pub fn force_resume(host: &HostState, id: &str) {
    if !host.controller.force_resume(id) {
        log::debug!("force-resume of terminal {id}: nothing was held");
    }
}

/// Map the rings the owning process created and start writing to them.
pub fn init_buffers(
    host: &HostState,
    visual_path: Option<&Path>,
    analysis_path: Option<&Path>,
) -> Result<(), CommandError> {
    if let Some(path) = visual_path {
        host.channels.attach(Channel::Visual, RingBuffer::open(path)?);
    }
    if let Some(path) = analysis_path {
        host.channels.attach(Channel::Analysis, RingBuffer::open(path)?);
    }
    Ok(())
}

/// Connect the data port; fallback `data` events go there once connected.
pub fn connect_port(host: &HostState, socket_path: PathBuf) {
    let sink = host.sink.clone();
    tokio::spawn(async move {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => sink.attach_port(stream),
            Err(e) => {
                log::warn!("failed to connect data port {}: {e}", socket_path.display());
                sink.error(
                    None,
                    format!("failed to connect data port {}: {e}", socket_path.display()),
                );
            }
        }
    });
}

/// Kill every session and start shutting down.
pub fn dispose(host: &HostState) {
    host.begin_shutdown();
    host.controller.shutdown();
    let ids = host.registry().list_sessions();
    for id in ids {
        terminal::kill(host, &id, Some("dispose".to_string()));
    }
    log::info!("host disposed");
}
