//! Transmission of serialized payloads to the remote service.

mod dry_run;
mod http;
mod serializer;

use async_trait::async_trait;

use crate::dispatch::Credential;
use crate::error::TransportError;

pub use dry_run::DryRunTransport;
pub use http::{HttpTransport, HttpTransportConfig, DEFAULT_DOCUMENT_URL};
pub use serializer::{JsonSerializer, PayloadSerializer, RawSerializer};

/// Status returned by the remote service for one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self { status }
    }
}

/// Performs the network call for one queued item.
///
/// The dispatcher runs every call in its own task, so an implementation may
/// take as long as the remote service needs. Any status other than the
/// dispatcher's success status, and any `Err`, is treated as a retryable
/// failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a serialized payload authenticated with `credential`.
    async fn send(
        &self,
        body: Vec<u8>,
        credential: &Credential,
    ) -> Result<TransportResponse, TransportError>;
}
