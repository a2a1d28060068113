//! Host configuration.
//!
//! Every field has a default, so an absent or partial config file is fine.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("{name} must be within (0, 100], got {value}")]
    PercentOutOfRange { name: &'static str, value: f64 },
    #[error("governor disengage percent ({disengage}) must be below engage percent ({engage})")]
    WatermarksInverted { engage: f64, disengage: f64 },
    #[error("acknowledgement low water ({low}) must be below high water ({high})")]
    AckWatermarksInverted { high: u64, low: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackpressureConfig {
    /// How often a paused session's ring is re-checked.
    pub poll_interval_ms: u64,
    /// Hard ceiling on a single backpressure pause.
    pub max_pause_ms: u64,
    /// Resume once the visual ring drains below this fill level.
    pub resume_threshold_percent: f64,
    /// Unacknowledged fallback bytes at which a session is paused.
    pub ack_high_water_bytes: u64,
    /// An acknowledgement that brings the backlog to this level resumes it.
    pub ack_low_water_bytes: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_pause_ms: 5_000,
            resume_threshold_percent: 80.0,
            ack_high_water_bytes: 512 * 1024,
            ack_low_water_bytes: 64 * 1024,
        }
    }
}

impl BackpressureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_millis(self.max_pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorConfig {
    pub check_interval_ms: u64,
    pub engage_percent: f64,
    pub disengage_percent: f64,
    pub max_throttle_ms: u64,
    /// Memory budget for the host. Defaults to 1 GiB, or a quarter of
    /// system memory when that is smaller.
    pub memory_limit_bytes: Option<u64>,
    /// History lines kept per session when reclaiming memory.
    pub reclaim_history_lines: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 2_000,
            engage_percent: 80.0,
            disengage_percent: 60.0,
            max_throttle_ms: 10_000,
            memory_limit_bytes: None,
            reclaim_history_lines: 200,
        }
    }
}

impl GovernorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_throttle(&self) -> Duration {
        Duration::from_millis(self.max_throttle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub trash_ttl_ms: u64,
    pub history_lines: usize,
    /// Delay between individual resumes after a global pause.
    pub resume_stagger_ms: u64,
    pub process_scan_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            trash_ttl_ms: 120_000,
            history_lines: 1_000,
            resume_stagger_ms: 25,
            process_scan_interval_ms: 3_000,
        }
    }
}

impl SessionConfig {
    pub fn trash_ttl(&self) -> Duration {
        Duration::from_millis(self.trash_ttl_ms)
    }

    pub fn resume_stagger(&self) -> Duration {
        Duration::from_millis(self.resume_stagger_ms)
    }

    pub fn process_scan_interval(&self) -> Duration {
        Duration::from_millis(self.process_scan_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub backpressure: BackpressureConfig,
    pub governor: GovernorConfig,
    pub sessions: SessionConfig,
}

impl HostConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("backpressure.pollIntervalMs", self.backpressure.poll_interval_ms),
            ("governor.checkIntervalMs", self.governor.check_interval_ms),
            ("sessions.processScanIntervalMs", self.sessions.process_scan_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }

        let percents = [
            ("backpressure.resumeThresholdPercent", self.backpressure.resume_threshold_percent),
            ("governor.engagePercent", self.governor.engage_percent),
            ("governor.disengagePercent", self.governor.disengage_percent),
        ];
        for (name, value) in percents {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::PercentOutOfRange { name, value });
            }
        }

        if self.governor.disengage_percent >= self.governor.engage_percent {
            return Err(ConfigError::WatermarksInverted {
                engage: self.governor.engage_percent,
                disengage: self.governor.disengage_percent,
            });
        }
        let (high, low) = (
            self.backpressure.ack_high_water_bytes,
            self.backpressure.ack_low_water_bytes,
        );
        if low >= high {
            return Err(ConfigError::AckWatermarksInverted { high, low });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backpressure.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.backpressure.max_pause(), Duration::from_secs(5));
        assert_eq!(config.governor.max_throttle(), Duration::from_secs(10));
        assert_eq!(config.sessions.trash_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_json() {
        let config: HostConfig =
            serde_json::from_str(r#"{"governor":{"engagePercent":90,"memoryLimitBytes":1024}}"#)
                .unwrap();
        assert_eq!(config.governor.engage_percent, 90.0);
        assert_eq!(config.governor.memory_limit_bytes, Some(1024));
        assert_eq!(config.governor.disengage_percent, 60.0);
        assert_eq!(config.backpressure, BackpressureConfig::default());
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let mut config = HostConfig::default();
        config.governor.disengage_percent = 85.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WatermarksInverted { .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_ack_watermarks() {
        let mut config = HostConfig::default();
        config.backpressure.ack_low_water_bytes = config.backpressure.ack_high_water_bytes;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AckWatermarksInverted { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = HostConfig::default();
        config.backpressure.poll_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("backpressure.pollIntervalMs"))
        );
    }

    #[test]
    fn test_rejects_bad_percent() {
        let mut config = HostConfig::default();
        config.backpressure.resume_threshold_percent = 120.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PercentOutOfRange { .. })
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termhost.json");
        std::fs::write(&path, r#"{"sessions":{"trashTtlMs":500}}"#).unwrap();

        let config = HostConfig::load(Some(&path)).unwrap();
        assert_eq!(config.sessions.trash_ttl(), Duration::from_millis(500));
        assert!(HostConfig::load(Some(&dir.path().join("missing.json"))).is_err());
        assert_eq!(HostConfig::load(None).unwrap(), HostConfig::default());
    }
}
