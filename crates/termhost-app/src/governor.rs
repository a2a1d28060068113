//! Host-wide memory governor.
//!
//! Samples the host's resident memory against a limit every check interval.
//! Crossing the engage watermark holds every session with
//! [`PauseHolder::Governor`]; dropping below the disengage watermark, or
//! staying throttled for the maximum duration, releases them again.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use termhost_pty::PauseHolder;

use crate::config::GovernorConfig;
use crate::ipc::HostEvent;
use crate::state::{release_staggered, HostState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    pub fn percent(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64 * 100.0
    }
}

/// Source of memory usage samples.
pub trait MemoryProbe: Send + Sync {
    /// `None` when usage cannot be determined this round.
    fn sample(&mut self) -> Option<MemorySample>;
}

/// Budget used when none is configured, capped at a quarter of system memory.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

fn default_limit(total_memory: u64) -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES.min(total_memory / 4)
}

/// Resident memory of this process, via `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
    limit_bytes: Option<u64>,
}

impl SysinfoProbe {
    /// `limit_bytes` of `None` uses the default budget.
    pub fn new(limit_bytes: Option<u64>) -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| log::warn!("cannot determine own pid, governor disabled: {e}"))
            .ok();
        Self {
            system: System::new(),
            pid,
            limit_bytes,
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&mut self) -> Option<MemorySample> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let used_bytes = self.system.process(pid)?.memory();
        let limit_bytes = match self.limit_bytes {
            Some(limit) => limit,
            None => {
                self.system.refresh_memory();
                default_limit(self.system.total_memory())
            }
        };
        (limit_bytes > 0).then_some(MemorySample {
            used_bytes,
            limit_bytes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DisengageReason {
    Recovered,
    MaxDuration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GovernorAction {
    None,
    Engage { usage_percent: f64 },
    Disengage { after: Duration, reason: DisengageReason },
}

/// Process-wide throttle state.
#[derive(Debug, Default)]
pub struct GovernorState {
    throttle_started_at: Option<Instant>,
}

impl GovernorState {
    pub fn is_throttling(&self) -> bool {
        self.throttle_started_at.is_some()
    }

    /// Decide what to do with a new sample, updating the state.
    pub fn evaluate(
        &mut self,
        sample: Option<&MemorySample>,
        now: Instant,
        config: &GovernorConfig,
    ) -> GovernorAction {
        let usage = sample.map(MemorySample::percent);
        match self.throttle_started_at {
            None => match usage {
                Some(usage) if usage >= config.engage_percent => {
                    self.throttle_started_at = Some(now);
                    GovernorAction::Engage {
                        usage_percent: usage,
                    }
                }
                _ => GovernorAction::None,
            },
            Some(started) => {
                let after = now.saturating_duration_since(started);
                let reason = if usage.is_some_and(|u| u < config.disengage_percent) {
                    DisengageReason::Recovered
                } else if after >= config.max_throttle() {
                    DisengageReason::MaxDuration
                } else {
                    return GovernorAction::None;
                };
                self.throttle_started_at = None;
                GovernorAction::Disengage { after, reason }
            }
        }
    }
}

pub struct ResourceGovernor {
    host: Arc<HostState>,
    probe: Box<dyn MemoryProbe>,
}

impl ResourceGovernor {
    pub fn new(host: Arc<HostState>, probe: Box<dyn MemoryProbe>) -> Self {
        Self { host, probe }
    }

    /// Take one sample and act on it.
    pub async fn tick(&mut self) {
        let sample = self.probe.sample();
        let action = self.host.throttle().evaluate(
            sample.as_ref(),
            Instant::now(),
            &self.host.config.governor,
        );
        match action {
            GovernorAction::None => {}
            GovernorAction::Engage { usage_percent } => self.engage(usage_percent),
            GovernorAction::Disengage { after, reason } => self.disengage(after, reason).await,
        }
    }

    fn engage(&self, usage_percent: f64) {
        let paused = {
            let registry = self.host.registry();
            let ids = registry.pause_all(PauseHolder::Governor);
            registry.trim_history(self.host.config.governor.reclaim_history_lines);
            ids.len()
        };
        log::warn!("memory at {usage_percent:.1}%, throttling {paused} sessions");
        self.host.sink.emit(HostEvent::HostThrottled {
            is_throttled: true,
            reason: Some("memory-pressure".to_string()),
            usage_percent: Some(usage_percent),
            duration_ms: None,
        });
    }

    async fn disengage(&self, after: Duration, reason: DisengageReason) {
        log::info!(
            "throttle lifted after {}ms ({reason:?})",
            after.as_millis()
        );
        self.host.sink.emit(HostEvent::HostThrottled {
            is_throttled: false,
            reason: None,
            usage_percent: None,
            duration_ms: Some(after.as_millis() as u64),
        });
        release_staggered(
            &self.host,
            PauseHolder::Governor,
            self.host.config.sessions.resume_stagger(),
        )
        .await;
    }

    /// Tick every check interval until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.host.config.governor.check_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::state::test_support::{event_types, test_host};
    use std::collections::VecDeque;
    use termhost_pty::SpawnOptions;

    struct ScriptedProbe(VecDeque<Option<f64>>);

    impl MemoryProbe for ScriptedProbe {
        fn sample(&mut self) -> Option<MemorySample> {
            let percent = self.0.pop_front().flatten()?;
            Some(MemorySample {
                used_bytes: (percent * 10.0) as u64,
                limit_bytes: 1000,
            })
        }
    }

    fn probe(script: &[Option<f64>]) -> Box<dyn MemoryProbe> {
        Box::new(ScriptedProbe(script.iter().copied().collect()))
    }

    fn sample(percent: f64) -> MemorySample {
        MemorySample {
            used_bytes: (percent * 10.0) as u64,
            limit_bytes: 1000,
        }
    }

    fn sh() -> SpawnOptions {
        SpawnOptions {
            shell: Some("/bin/sh".to_string()),
            ..SpawnOptions::default()
        }
    }

    #[test]
    fn test_sample_percent() {
        assert_eq!(sample(50.0).percent(), 50.0);
        let empty = MemorySample {
            used_bytes: 5,
            limit_bytes: 0,
        };
        assert_eq!(empty.percent(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_watermarks() {
        let config = GovernorConfig::default();
        let mut state = GovernorState::default();
        let t0 = Instant::now();

        assert_eq!(state.evaluate(Some(&sample(79.0)), t0, &config), GovernorAction::None);
        assert_eq!(
            state.evaluate(Some(&sample(80.0)), t0, &config),
            GovernorAction::Engage { usage_percent: 80.0 }
        );
        assert!(state.is_throttling());

        // Between the watermarks nothing changes.
        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(state.evaluate(Some(&sample(70.0)), t1, &config), GovernorAction::None);
        assert_eq!(state.evaluate(None, t1, &config), GovernorAction::None);

        let t2 = t0 + Duration::from_secs(4);
        assert_eq!(
            state.evaluate(Some(&sample(59.0)), t2, &config),
            GovernorAction::Disengage {
                after: Duration::from_secs(4),
                reason: DisengageReason::Recovered
            }
        );
        assert!(!state.is_throttling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_max_duration() {
        let config = GovernorConfig::default();
        let mut state = GovernorState::default();
        let t0 = Instant::now();
        state.evaluate(Some(&sample(95.0)), t0, &config);

        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(
            state.evaluate(Some(&sample(95.0)), t1, &config),
            GovernorAction::Disengage {
                after: Duration::from_secs(10),
                reason: DisengageReason::MaxDuration
            }
        );
        // Still high: engages again on the next check.
        assert!(matches!(
            state.evaluate(Some(&sample(95.0)), t1, &config),
            GovernorAction::Engage { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engage_and_disengage_sessions() {
        let mut config = HostConfig::default();
        config.governor.reclaim_history_lines = 1;
        let mut t = test_host(config);
        for id in ["a", "b"] {
            let spawned = t.host.registry().spawn(id, &sh()).unwrap();
            spawned.info.lock().unwrap().record_output(b"1\n2\n3\n");
            t.host.controller.register(id, spawned.gate);
        }

        let mut governor =
            ResourceGovernor::new(std::sync::Arc::clone(&t.host), probe(&[Some(85.0), Some(50.0)]));
        governor.tick().await;

        assert!(t.host.is_throttling());
        for id in ["a", "b"] {
            assert_eq!(t.host.registry().holders(id).unwrap(), vec![PauseHolder::Governor]);
            assert_eq!(t.host.registry().history(id, 10).unwrap(), vec!["3"]);
        }

        // A session spawned mid-throttle is released with the others.
        t.host.registry().spawn("c", &sh()).unwrap();
        t.host.registry().pause("c", PauseHolder::Governor);

        governor.tick().await;
        assert!(!t.host.is_throttling());
        for id in ["a", "b", "c"] {
            assert!(t.host.registry().holders(id).unwrap().is_empty());
        }

        let events = event_types(&mut t.events);
        let throttles: Vec<&serde_json::Value> = events
            .iter()
            .filter(|e| e["type"] == "host-throttled")
            .collect();
        assert_eq!(throttles.len(), 2);
        assert_eq!(throttles[0]["isThrottled"], true);
        assert_eq!(throttles[0]["usagePercent"], 85.0);
        assert_eq!(throttles[1]["isThrottled"], false);
        // Governor holds never show up as per-terminal status.
        assert!(!events.iter().any(|e| e["type"] == "terminal-status"));
        t.host.registry().kill_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_disengages_on_timeout() {
        let mut t = test_host(HostConfig::default());
        t.host.registry().spawn("a", &sh()).unwrap();

        let governor = ResourceGovernor::new(
            std::sync::Arc::clone(&t.host),
            probe(&[Some(90.0), None, None, None, None, None, None]),
        );
        let task = tokio::spawn(governor.run(t.host.shutdown_signal()));

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(t.host.is_throttling());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!t.host.is_throttling());
        assert!(t.host.registry().holders("a").unwrap().is_empty());

        t.host.begin_shutdown();
        task.await.unwrap();
        let throttled: Vec<bool> = event_types(&mut t.events)
            .iter()
            .filter(|e| e["type"] == "host-throttled")
            .map(|e| e["isThrottled"].as_bool().unwrap())
            .collect();
        assert_eq!(throttled, vec![true, false]);
        t.host.registry().kill_all();
    }

    #[test]
    fn test_default_limit_is_bounded() {
        let gib = 1024 * 1024 * 1024;
        assert_eq!(default_limit(64 * gib), DEFAULT_MEMORY_LIMIT_BYTES);
        assert_eq!(default_limit(2 * gib), gib / 2);
        assert_eq!(default_limit(0), 0);
    }

    #[test]
    fn test_probes_can_move_between_threads() {
        fn shareable<T: Send + Sync + ?Sized>() {}
        shareable::<SysinfoProbe>();
        shareable::<dyn MemoryProbe>();
    }

    #[test]
    fn test_sysinfo_probe_reports_own_memory() {
        let mut probe = SysinfoProbe::new(None);
        let sample = probe.sample().expect("own process is visible");
        assert!(sample.used_bytes > 0);
        assert!(sample.percent() < 100.0);
    }
}
