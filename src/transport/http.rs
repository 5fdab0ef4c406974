//! HTTP transport backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, instrument};

use super::{Transport, TransportResponse};
use crate::dispatch::Credential;
use crate::error::{Result, TransportError};

/// Document creation endpoint of the remote service.
pub const DEFAULT_DOCUMENT_URL: &str = "https://ismp.crpt.ru/api/v3/lk/documents/create";

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Target URL every document is POSTed to
    pub url: String,
    /// Maximum time allowed for a single request
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DOCUMENT_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// POSTs JSON bodies with the item credential as a bearer token.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// Create a transport with its own connection pool.
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Create a transport that shares an existing client.
    pub fn with_client(client: reqwest::Client, config: HttpTransportConfig) -> Self {
        Self { client, config }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, body, credential), fields(url = %self.config.url, bytes = body.len()))]
    async fn send(
        &self,
        body: Vec<u8>,
        credential: &Credential,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(&self.config.url)
            .header(CONTENT_TYPE, "application/json")
            .header("charset", "utf-8")
            .header(AUTHORIZATION, format!("Bearer {}", credential.expose()))
            .timeout(self.config.timeout)
            .body(body)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status().as_u16();
        debug!(status = status, "Remote service responded");
        Ok(TransportResponse::new(status))
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
