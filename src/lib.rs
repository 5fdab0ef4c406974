//! Docpacer - Rate-Limited Document Submission Client
//!
//! This crate queues documents for a remote registration API and sends them
//! from a single background worker, no faster than a sliding window quota
//! allows. Callers never block: `submit` returns as soon as the document is
//! queued, and failed sends are retried from the tail of the queue until the
//! remote service accepts them.

pub mod config;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod ratelimit;
pub mod transport;

pub use dispatch::{Credential, Dispatcher, DispatcherConfig, DispatcherState, ItemId};
pub use error::{DocpacerError, Result};
pub use ratelimit::{RateLimitConfig, TimeUnit};
