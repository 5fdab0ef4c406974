//! Transport that logs instead of sending.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::info;

use super::{Transport, TransportResponse};
use crate::dispatch::Credential;
use crate::error::TransportError;

/// Logs every body and answers with a synthetic status.
///
/// A non-zero `failure_rate` answers 503 for that fraction of sends, which
/// exercises the retry path without a remote service.
#[derive(Debug, Clone)]
pub struct DryRunTransport {
    failure_rate: f64,
    latency: Duration,
}

impl DryRunTransport {
    pub fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
        }
    }
}

impl Default for DryRunTransport {
    fn default() -> Self {
        Self::new(0.0, Duration::from_millis(20))
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn send(
        &self,
        body: Vec<u8>,
        credential: &Credential,
    ) -> Result<TransportResponse, TransportError> {
        tokio::time::sleep(self.latency).await;

        let fail = rand::thread_rng().gen_bool(self.failure_rate);
        let status = if fail { 503 } else { 200 };

        info!(
            bytes = body.len(),
            credential = ?credential,
            status = status,
            "Dry run send"
        );

        Ok(TransportResponse::new(status))
    }
}
