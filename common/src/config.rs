//! Configuration types for runtime, output and supervision settings

use std::time::Duration;

/// Runner period used when none is configured.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(300);
/// Pause after a failed cycle used when none is configured.
pub const DEFAULT_FAILURE_SLEEP: Duration = Duration::from_secs(5);
/// Stop flag polling granularity used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime configuration for tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress all log output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary at the end
    pub print_summary: bool,
}

/// Timing of a [`crate::runner::SupervisedRunner`]; fixed for the runner's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Minimum time between the starts of two successful cycles
    pub period: Duration,
    /// Pause before retrying after a failed cycle
    pub failure_sleep: Duration,
    /// Longest stretch the runner sleeps without checking the stop flag
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            failure_sleep: DEFAULT_FAILURE_SLEEP,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RunnerConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be greater than zero".to_string());
        }
        if self.failure_sleep.is_zero() {
            return Err("failure_sleep must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runner_config_is_valid() {
        let config = RunnerConfig::default();
        assert_eq!(config.period, Duration::from_secs(300));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = RunnerConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RunnerConfig {
            failure_sleep: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RunnerConfig {
            period: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }
}
