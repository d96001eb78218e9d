//! Recorder configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReplayError, ReplayResult};

/// Default upper bound for the in-memory segment (20 MB)
pub const DEFAULT_MAX_BUFFER_SIZE_BYTES: usize = 20_000_000;
/// Default debounce delay before a flush
pub const DEFAULT_MIN_FLUSH_DELAY_MS: u64 = 5_000;
/// Default ceiling for a debounced flush burst
pub const DEFAULT_MAX_FLUSH_DELAY_MS: u64 = 5_500;
/// Default inactivity window after which a session expires (15 minutes)
pub const DEFAULT_SESSION_INACTIVITY_THRESHOLD_MS: u64 = 900_000;
/// Default maximum lifetime of a session (60 minutes)
pub const DEFAULT_MAX_SESSION_DURATION_MS: u64 = 3_600_000;
/// Default share of sessions that get recorded
pub const DEFAULT_SESSION_SAMPLE_RATE: f64 = 1.0;

fn default_max_buffer_size_bytes() -> usize {
    DEFAULT_MAX_BUFFER_SIZE_BYTES
}

fn default_min_flush_delay_ms() -> u64 {
    DEFAULT_MIN_FLUSH_DELAY_MS
}

fn default_max_flush_delay_ms() -> u64 {
    DEFAULT_MAX_FLUSH_DELAY_MS
}

fn default_session_inactivity_threshold_ms() -> u64 {
    DEFAULT_SESSION_INACTIVITY_THRESHOLD_MS
}

fn default_max_session_duration_ms() -> u64 {
    DEFAULT_MAX_SESSION_DURATION_MS
}

fn default_session_sample_rate() -> f64 {
    DEFAULT_SESSION_SAMPLE_RATE
}

/// Configuration threaded into the [`ReplayController`](crate::ReplayController).
///
/// Every field has a serde default, so a partial JSON/TOML document is enough
/// to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Estimated serialized size at which the buffer is dropped
    #[serde(default = "default_max_buffer_size_bytes")]
    pub max_buffer_size_bytes: usize,

    /// Debounce delay restarted by every flush request
    #[serde(default = "default_min_flush_delay_ms")]
    pub min_flush_delay_ms: u64,

    /// Longest a burst of requests can defer a flush
    #[serde(default = "default_max_flush_delay_ms")]
    pub max_flush_delay_ms: u64,

    /// Idle time after which the session is replaced
    #[serde(default = "default_session_inactivity_threshold_ms")]
    pub session_inactivity_threshold_ms: u64,

    /// Absolute session lifetime, measured from `started_at`
    #[serde(default = "default_max_session_duration_ms")]
    pub max_session_duration_ms: u64,

    /// Probability (0.0 - 1.0) that `initialize()` records the session
    #[serde(default = "default_session_sample_rate")]
    pub session_sample_rate: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_buffer_size_bytes: default_max_buffer_size_bytes(),
            min_flush_delay_ms: default_min_flush_delay_ms(),
            max_flush_delay_ms: default_max_flush_delay_ms(),
            session_inactivity_threshold_ms: default_session_inactivity_threshold_ms(),
            max_session_duration_ms: default_max_session_duration_ms(),
            session_sample_rate: default_session_sample_rate(),
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> ReplayResult<()> {
        if self.max_buffer_size_bytes == 0 {
            return Err(ReplayError::Configuration(
                "max_buffer_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.min_flush_delay_ms > self.max_flush_delay_ms {
            return Err(ReplayError::Configuration(format!(
                "min_flush_delay_ms ({}) cannot exceed max_flush_delay_ms ({})",
                self.min_flush_delay_ms, self.max_flush_delay_ms
            )));
        }
        if self.session_inactivity_threshold_ms == 0 {
            return Err(ReplayError::Configuration(
                "session_inactivity_threshold_ms must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.session_sample_rate) {
            return Err(ReplayError::Configuration(format!(
                "session_sample_rate must be between 0 and 1, got {}",
                self.session_sample_rate
            )));
        }
        Ok(())
    }

    pub fn min_flush_delay(&self) -> Duration {
        Duration::from_millis(self.min_flush_delay_ms)
    }

    pub fn max_flush_delay(&self) -> Duration {
        Duration::from_millis(self.max_flush_delay_ms)
    }
}
