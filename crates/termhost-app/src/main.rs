//! termhost: a headless multi-session terminal host.
//!
//! The owning process drives the host over stdin/stdout with newline
//! delimited JSON. Terminal output goes to shared-memory rings when they are
//! attached and falls back to `data` messages otherwise.

mod backpressure;
mod bus;
mod commands;
mod config;
mod dispatch;
mod governor;
mod io_thread;
mod ipc;
mod panics;
mod process_tree;
mod scheduler;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use config::HostConfig;
use dispatch::{dispatch_line, Next};
use ipc::{EventSink, HostEvent};
use state::HostState;

/// Longest we wait for queued events to reach stdout on the way out.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "termhost", version, about = "Headless multi-session terminal host")]
struct Cli {
    /// Path to a JSON config file. Defaults apply when omitted.
    #[arg(long, env = "TERMHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "TERMHOST_LOG", default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = HostConfig::load(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(run(config))
}

/// Logs go to stderr; stdout carries the control protocol.
fn init_logging(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .init();
}

async fn run(config: HostConfig) -> anyhow::Result<()> {
    let (sink, sink_rx) = EventSink::channel();
    panics::install_hook(sink.clone());
    let (bus, bus_rx) = bus::EventBus::channel();
    let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
    let host = Arc::new(HostState::new(
        config,
        sink.clone(),
        bus,
        exits_tx,
        Handle::current(),
    ));

    let mut writer = tokio::spawn(ipc::run_writer(sink_rx, tokio::io::stdout()));
    tokio::spawn(bus::relay(bus_rx, sink.clone()));
    scheduler::start_scheduler(&host);

    sink.emit(HostEvent::Ready {
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });
    log::info!("termhost {} ready", env!("CARGO_PKG_VERSION"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if dispatch_line(&host, &line) == Next::Shutdown {
                        break;
                    }
                }
                Ok(None) => {
                    log::info!("control channel closed");
                    commands::flow::dispose(&host);
                    break;
                }
                Err(e) => {
                    log::error!("failed to read control channel: {e}");
                    commands::flow::dispose(&host);
                    break;
                }
            },
            Some(exit) = exits_rx.recv() => {
                tokio::spawn(commands::terminal::reap_exited(Arc::clone(&host), exit));
            }
            result = &mut writer => {
                match result {
                    Ok(Ok(_)) => log::info!("event writer finished"),
                    Ok(Err(e)) => log::error!("event writer failed: {e}"),
                    Err(e) => log::error!("event writer task failed: {e}"),
                }
                commands::flow::dispose(&host);
                return Ok(());
            }
        }
    }

    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, sink.flushed())
        .await
        .is_err()
    {
        log::warn!("timed out flushing events on shutdown");
    }
    Ok(())
}
