//! Rate-limited asynchronous dispatch queue.
//!
//! Callers hand documents to a [`Dispatcher`], which queues them and lets a
//! single background worker issue the transmissions no faster than the
//! configured sliding window allows. Failed transmissions go back to the
//! tail of the queue.

mod dispatcher;
mod item;
mod queue;
mod worker;

pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherState, DispatcherStats, DEFAULT_SUCCESS_STATUS,
};
pub use item::{Credential, ItemId, QueuedItem};
pub use queue::SubmissionQueue;
