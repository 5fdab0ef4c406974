//! Rate limit configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DocpacerError, Result};

/// Time unit a request limit is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Sliding window quota: at most `max_requests` sends within any `window`.
///
/// Immutable once constructed; construction rejects a zero limit or a zero
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    window: Duration,
    max_requests: u32,
}

impl RateLimitConfig {
    /// Create a configuration from an explicit window length.
    pub fn new(window: Duration, max_requests: u32) -> Result<Self> {
        if max_requests == 0 {
            return Err(DocpacerError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(DocpacerError::Config(
                "rate limit window must be longer than zero".to_string(),
            ));
        }
        Ok(Self {
            window,
            max_requests,
        })
    }

    /// Create a configuration allowing `max_requests` per one `unit`.
    pub fn per_unit(unit: TimeUnit, max_requests: u32) -> Result<Self> {
        Self::new(unit.duration(), max_requests)
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum number of sends admitted within one window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}
