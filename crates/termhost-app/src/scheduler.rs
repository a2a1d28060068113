//! Background loops that run for the life of the host: the memory governor,
//! the trash sweeper, and the process-tree scanner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::BusEvent;
use crate::commands::terminal;
use crate::governor::{ResourceGovernor, SysinfoProbe};
use crate::process_tree::ProcessScanner;
use crate::state::HostState;

/// How often trashed sessions are checked for expiry.
const TRASH_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Start every background loop. Each exits once shutdown begins.
pub fn start_scheduler(host: &Arc<HostState>) {
    let probe = SysinfoProbe::new(host.config.governor.memory_limit_bytes);
    let governor = ResourceGovernor::new(Arc::clone(host), Box::new(probe));
    tokio::spawn(governor.run(host.shutdown_signal()));

    tokio::spawn(run_trash_sweeper(Arc::clone(host), host.shutdown_signal()));
    tokio::spawn(run_process_scanner(Arc::clone(host), host.shutdown_signal()));
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_trash_sweeper(host: Arc<HostState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(TRASH_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => terminal::sweep_expired_trash(&host),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_process_scanner(host: Arc<HostState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(host.config.sessions.process_scan_interval());
    let mut scanner = Some(ProcessScanner::new());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let current = scanner.take().unwrap_or_default();
                scanner = Some(scan_once(&host, current).await);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// One scan off the runtime. Returns the scanner for the next round; a scan
/// that panicked starts over with a fresh one.
async fn scan_once(host: &HostState, mut scanner: ProcessScanner) -> ProcessScanner {
    let sessions = host.registry().process_ids();
    let result = tokio::task::spawn_blocking(move || {
        let events = scanner.scan(&sessions);
        (scanner, events)
    })
    .await;

    let (scanner, events) = match result {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("process scan failed: {e}");
            return ProcessScanner::new();
        }
    };
    apply_scan(host, events);
    scanner
}

fn apply_scan(host: &HostState, events: Vec<BusEvent>) {
    for event in events {
        match &event {
            BusEvent::AgentDetected { id, agent } => {
                log::info!("terminal {id} is running {}", agent.as_str());
                host.registry().set_detected_agent(id, Some(*agent));
            }
            BusEvent::AgentExited { id, agent } => {
                log::info!("{} exited in terminal {id}", agent.as_str());
                host.registry().set_detected_agent(id, None);
            }
            _ => {}
        }
        host.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::state::test_support::*;
    use termhost_pty::{SpawnOptions, TerminalKind};

    #[tokio::test]
    async fn test_apply_scan_records_detected_agent() {
        let mut t = test_host(HostConfig::default());
        let options = SpawnOptions {
            shell: Some("/bin/sh".to_string()),
            ..SpawnOptions::default()
        };
        terminal::spawn(&t.host, Some("t1".into()), options).unwrap();

        apply_scan(
            &t.host,
            vec![BusEvent::AgentDetected {
                id: "t1".into(),
                agent: TerminalKind::Codex,
            }],
        );
        let snapshot = t.host.registry().snapshot("t1").unwrap();
        assert_eq!(snapshot.detected_agent, Some(TerminalKind::Codex));
        assert!(matches!(
            t.bus_events.try_recv().unwrap(),
            BusEvent::AgentDetected { .. }
        ));

        apply_scan(
            &t.host,
            vec![BusEvent::AgentExited {
                id: "t1".into(),
                agent: TerminalKind::Codex,
            }],
        );
        assert_eq!(t.host.registry().snapshot("t1").unwrap().detected_agent, None);
        t.host.registry().kill_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let t = test_host(HostConfig::default());
        let task = tokio::spawn(run_trash_sweeper(
            Arc::clone(&t.host),
            t.host.shutdown_signal(),
        ));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!task.is_finished());

        t.host.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
