//! HTTP transport seam.
//!
//! The engine only ever issues HEAD (size and range capability probing)
//! and GET (body streaming, optionally ranged). Putting those two calls
//! behind a trait keeps the rest of the pipeline testable against an
//! in-memory transport.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;

use crate::error::{ErrorCode, FragmenterError, FragmenterResult};

/// Body chunk stream produced by a GET request.
pub type ByteStream = Pin<Box<dyn Stream<Item = FragmenterResult<Bytes>> + Send>>;

/// What a HEAD request revealed about a URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeInfo {
    /// Advertised `content-length`, when present.
    pub content_length: Option<u64>,
    /// Whether `accept-ranges: bytes` was advertised.
    pub accepts_ranges: bool,
}

/// Minimal HTTP surface used by the transfer pipeline.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// HEAD a URL for its size and range capability.
    async fn probe(&self, url: &str) -> FragmenterResult<ProbeInfo>;

    /// GET a URL's body from a byte offset.
    ///
    /// A `Range: bytes=<start>-` header is sent when `start_offset` is
    /// non-zero. Each yielded chunk is already classified into the engine's
    /// error taxonomy.
    async fn get(&self, url: &str, start_offset: u64) -> FragmenterResult<ByteStream>;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured client (proxies, TLS settings, idle timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn probe(&self, url: &str) -> FragmenterResult<ProbeInfo> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| FragmenterError::from_transport(&e))?;

        if !response.status().is_success() {
            return Err(FragmenterError::new(
                ErrorCode::NetworkError,
                format!("HEAD {url} returned {}", response.status()),
            ));
        }

        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(ProbeInfo {
            content_length,
            accepts_ranges,
        })
    }

    async fn get(&self, url: &str, start_offset: u64) -> FragmenterResult<ByteStream> {
        let mut request = self.client.get(url);
        if start_offset > 0 {
            request = request.header(
                reqwest::header::RANGE,
                format!("bytes={start_offset}-"),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| FragmenterError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FragmenterError::new(
                ErrorCode::NetworkError,
                format!("GET {url} returned {status}"),
            ));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FragmenterError::from_transport(&e)));
        Ok(Box::pin(stream))
    }
}
