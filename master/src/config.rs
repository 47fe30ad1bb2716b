use shared::{ZONE_END_PORT, ZONE_STARTUP_SECS, ZONE_START_PORT};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("port range {start}..{end} is empty")]
    EmptyPortRange { start: u16, end: u16 },
    #[error("startup deadline must be greater than zero")]
    ZeroStartupDeadline,
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("probe timeout must be greater than zero")]
    ZeroProbeTimeout,
    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,
    #[error("worker host is empty")]
    EmptyWorkerHost,
}

/// Settings for launching and tracking zone workers.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Host workers bind to and are reached at.
    pub worker_host: String,
    /// First port handed to workers.
    pub port_start: u16,
    /// One past the last port handed to workers.
    pub port_end: u16,
    pub startup_deadline: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a terminated instance stays listed before it is evicted.
    pub eviction_grace: Duration,
    pub registry_path: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            worker_host: "127.0.0.1".to_string(),
            port_start: ZONE_START_PORT,
            port_end: ZONE_END_PORT,
            startup_deadline: Duration::from_secs(ZONE_STARTUP_SECS),
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            eviction_grace: DEFAULT_EVICTION_GRACE,
            registry_path: None,
        }
    }
}

impl LauncherConfig {
    /// Checks the settings, returning them unchanged when usable.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.worker_host.trim().is_empty() {
            return Err(ConfigurationError::EmptyWorkerHost);
        }
        if self.port_start >= self.port_end {
            return Err(ConfigurationError::EmptyPortRange {
                start: self.port_start,
                end: self.port_end,
            });
        }
        if self.startup_deadline.is_zero() {
            return Err(ConfigurationError::ZeroStartupDeadline);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::ZeroPollInterval);
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigurationError::ZeroProbeTimeout);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigurationError::ZeroSweepInterval);
        }
        Ok(self)
    }

    pub fn ports(&self) -> Range<u16> {
        self.port_start..self.port_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LauncherConfig::default().validate().unwrap();
        assert_eq!(config.ports(), 1300..1400);
        assert_eq!(config.startup_deadline, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_unusable_settings() {
        let empty_range = LauncherConfig {
            port_start: 1400,
            port_end: 1400,
            ..LauncherConfig::default()
        };
        assert_eq!(
            empty_range.validate().unwrap_err(),
            ConfigurationError::EmptyPortRange {
                start: 1400,
                end: 1400
            }
        );

        let no_deadline = LauncherConfig {
            startup_deadline: Duration::ZERO,
            ..LauncherConfig::default()
        };
        assert_eq!(
            no_deadline.validate().unwrap_err(),
            ConfigurationError::ZeroStartupDeadline
        );

        let no_poll = LauncherConfig {
            poll_interval: Duration::ZERO,
            ..LauncherConfig::default()
        };
        assert_eq!(
            no_poll.validate().unwrap_err(),
            ConfigurationError::ZeroPollInterval
        );

        let no_host = LauncherConfig {
            worker_host: "  ".to_string(),
            ..LauncherConfig::default()
        };
        assert_eq!(
            no_host.validate().unwrap_err(),
            ConfigurationError::EmptyWorkerHost
        );
    }
}
