//! Sliding window rate limiting.

mod config;
mod window;

pub use config::{RateLimitConfig, TimeUnit};
pub use window::{Admission, WindowTracker};
