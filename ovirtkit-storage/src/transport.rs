//! HTTP access to the image transfer endpoints (imageio daemon or proxy).

use async_trait::async_trait;
use ovirtkit_core::{ClientError, EngineConfig, ErrorCode, Result, client_builder};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Method, StatusCode};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub type UploadBody = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ImageTransport: Send + Sync {
    /// Sends an `OPTIONS` request and returns the response status.
    async fn probe(&self, url: &str) -> Result<u16>;

    /// Streams exactly `size` bytes from `body` with a single `PUT`.
    async fn put(&self, url: &str, size: u64, body: UploadBody) -> Result<()>;
}

/// Maps an unsuccessful transfer endpoint status to an error code.
pub fn status_code(status: u16) -> ErrorCode {
    match status {
        400..=499 => ErrorCode::PermanentHttpError,
        _ => ErrorCode::Connection,
    }
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds a client with the TLS settings of the engine connection.
    ///
    /// No overall request timeout is set: a `PUT` of a large image runs for
    /// as long as the bytes keep flowing.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = client_builder(config)?
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ClientError::wrap(e, ErrorCode::Bug, "cannot build HTTP client"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageTransport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<u16> {
        let response = self
            .client
            .request(Method::OPTIONS, url)
            .send()
            .await
            .map_err(|e| ClientError::wrap(e, ErrorCode::Connection, format!("OPTIONS {url} failed")))?;
        let status = response.status().as_u16();
        debug!(url, status, "probed transfer endpoint");
        Ok(status)
    }

    async fn put(&self, url: &str, size: u64, body: UploadBody) -> Result<()> {
        let stream = ReaderStream::new(body);
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| ClientError::wrap(e, ErrorCode::Unidentified, format!("PUT {url} failed")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(ClientError::new(
            status_code(status.as_u16()),
            format!("PUT {url} returned {}: {}", status_label(status), detail.trim()),
        ))
    }
}

fn status_label(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}
