//! Sliding window admission tracking.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::config::RateLimitConfig;

/// Upper bound on the up-front reservation; larger windows grow on demand.
const INITIAL_CAPACITY: u32 = 1024;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A send may be issued now. The caller records it once issued.
    Granted,
    /// The window is full; check again after at least this long.
    Wait(Duration),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Tracks the timestamps of admitted sends within the trailing window.
///
/// Timestamps are kept oldest first. An entry expires once its age reaches
/// the window length, so any half-open interval of one window length holds
/// at most `max_requests` recorded sends.
///
/// This uses `tokio::time::Instant` so a paused test runtime drives it.
pub struct WindowTracker {
    config: RateLimitConfig,
    entries: Mutex<VecDeque<Instant>>,
}

impl WindowTracker {
    /// Create a tracker with an empty window.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::with_capacity(
                config.max_requests().min(INITIAL_CAPACITY) as usize,
            )),
        }
    }

    /// Check whether a send may proceed now.
    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    /// Check whether a send may proceed at `now`.
    pub fn admit_at(&self, now: Instant) -> Admission {
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);

        if entries.len() < self.config.max_requests() as usize {
            return Admission::Granted;
        }

        // Non-empty here: max_requests is at least one.
        let oldest = entries[0];
        let age = now.saturating_duration_since(oldest);
        let wait = self.config.window().saturating_sub(age);

        trace!(
            occupancy = entries.len(),
            wait_ms = wait.as_millis() as u64,
            "Window full"
        );

        // prune() removed every entry with age >= window, so wait > 0.
        Admission::Wait(wait.max(Duration::from_nanos(1)))
    }

    /// Record a send issued now.
    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    /// Record a send issued at `now`.
    pub fn record_at(&self, now: Instant) {
        let mut entries = self.entries.lock();
        // Keep the sequence ordered even if callers hand in a stale instant.
        let at = entries.back().map_or(now, |last| now.max(*last));
        entries.push_back(at);
    }

    /// Number of sends currently counted against the window.
    pub fn occupancy(&self) -> usize {
        let mut entries = self.entries.lock();
        self.prune(&mut entries, Instant::now());
        entries.len()
    }

    /// The configuration this tracker enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn prune(&self, entries: &mut VecDeque<Instant>, now: Instant) {
        let window = self.config.window();
        while let Some(oldest) = entries.front() {
            if now.saturating_duration_since(*oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}
