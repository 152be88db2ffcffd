//! Loop configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use evloop_runtime::config::LoopConfig;
//! use std::time::Duration;
//!
//! let config = LoopConfig::from_env()
//!     .stat_interval(Duration::from_secs(1))
//!     .signal_poll(Duration::from_millis(20));
//! ```

pub mod defaults;

use std::time::Duration;

use evapi_core::env::env_get;

/// Loop configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Poll interval for stat watchers that ask for the default
    pub stat_interval: Duration,
    /// Upper bound on blocking while signal/child watchers are active
    pub signal_poll: Duration,
    /// Upper bound on any single block
    pub max_block: Duration,
    /// Initial pollfd capacity
    pub poll_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LoopConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `EV_STAT_INTERVAL_MS` - default stat poll interval
    /// - `EV_SIGNAL_POLL_MS` - block bound with signal/child watchers
    /// - `EV_MAX_BLOCK_MS` - block bound overall
    /// - `EV_POLL_CAPACITY` - initial pollfd capacity
    pub fn from_env() -> Self {
        Self {
            stat_interval: Duration::from_millis(env_get(
                "EV_STAT_INTERVAL_MS",
                defaults::STAT_INTERVAL_MS,
            )),
            signal_poll: Duration::from_millis(env_get(
                "EV_SIGNAL_POLL_MS",
                defaults::SIGNAL_POLL_MS,
            )),
            max_block: Duration::from_millis(env_get("EV_MAX_BLOCK_MS", defaults::MAX_BLOCK_MS)),
            poll_capacity: env_get("EV_POLL_CAPACITY", defaults::POLL_CAPACITY),
        }
    }

    /// Library defaults, no environment.
    pub fn new() -> Self {
        Self {
            stat_interval: Duration::from_millis(defaults::STAT_INTERVAL_MS),
            signal_poll: Duration::from_millis(defaults::SIGNAL_POLL_MS),
            max_block: Duration::from_millis(defaults::MAX_BLOCK_MS),
            poll_capacity: defaults::POLL_CAPACITY,
        }
    }

    pub fn stat_interval(mut self, d: Duration) -> Self {
        self.stat_interval = d;
        self
    }

    pub fn signal_poll(mut self, d: Duration) -> Self {
        self.signal_poll = d;
        self
    }

    pub fn max_block(mut self, d: Duration) -> Self {
        self.max_block = d;
        self
    }

    pub fn poll_capacity(mut self, n: usize) -> Self {
        self.poll_capacity = n;
        self
    }

    /// Effective stat interval for a watcher asking for `requested` seconds.
    pub fn stat_interval_for(&self, requested: f64) -> f64 {
        let min = defaults::MIN_STAT_INTERVAL_MS as f64 / 1000.0;
        if requested > 0.0 {
            requested.max(min)
        } else {
            self.stat_interval.as_secs_f64().max(min)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stat_interval < Duration::from_millis(defaults::MIN_STAT_INTERVAL_MS) {
            return Err(ConfigError::InvalidValue("stat_interval must be >= 100ms"));
        }
        if self.signal_poll.is_zero() {
            return Err(ConfigError::InvalidValue("signal_poll must be > 0"));
        }
        if self.max_block.is_zero() {
            return Err(ConfigError::InvalidValue("max_block must be > 0"));
        }
        if self.signal_poll > self.max_block {
            return Err(ConfigError::InvalidValue("signal_poll must be <= max_block"));
        }
        if self.poll_capacity == 0 {
            return Err(ConfigError::InvalidValue("poll_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn print(&self) {
        eprintln!("Event Loop Configuration:");
        eprintln!("  stat_interval:  {:?}", self.stat_interval);
        eprintln!("  signal_poll:    {:?}", self.signal_poll);
        eprintln!("  max_block:      {:?}", self.max_block);
        eprintln!("  poll_capacity:  {}", self.poll_capacity);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(LoopConfig::new().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LoopConfig::new()
            .stat_interval(Duration::from_secs(1))
            .signal_poll(Duration::from_millis(20))
            .poll_capacity(8);
        assert_eq!(config.stat_interval, Duration::from_secs(1));
        assert_eq!(config.signal_poll, Duration::from_millis(20));
        assert_eq!(config.poll_capacity, 8);
    }

    #[test]
    fn test_validation() {
        assert!(LoopConfig::new().stat_interval(Duration::from_millis(10)).validate().is_err());
        assert!(LoopConfig::new().signal_poll(Duration::ZERO).validate().is_err());
        assert!(LoopConfig::new()
            .max_block(Duration::from_millis(50))
            .signal_poll(Duration::from_millis(100))
            .validate()
            .is_err());
        assert!(LoopConfig::new().poll_capacity(0).validate().is_err());
    }

    #[test]
    fn test_stat_interval_for() {
        let config = LoopConfig::new().stat_interval(Duration::from_secs(2));
        assert_eq!(config.stat_interval_for(0.0), 2.0);
        assert_eq!(config.stat_interval_for(0.5), 0.5);
        assert_eq!(config.stat_interval_for(0.01), 0.1);
    }
}
