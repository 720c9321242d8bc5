use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_document, Document, ParseError};

/// Default per-source request timeout
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on a single feed body (10MB)
pub const DEFAULT_MAX_FEED_BYTES: usize = 10 * 1024 * 1024;

/// Errors that can occur while retrieving one feed source.
///
/// Every variant is a source-level failure: the coordinator records it
/// against the run and moves on to the next source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Feed XML could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// Response body exceeded the size limit
    #[error("Response too large (limit {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Bounds applied to every fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_bytes: DEFAULT_MAX_FEED_BYTES,
        }
    }
}

/// Build the shared HTTP client used for all feed fetches.
pub fn build_client(user_agent: &str) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Fetch one feed and parse it into a document tree.
///
/// A single attempt: the timeout covers the request and the whole body read.
/// Non-2xx statuses, oversized or truncated bodies and malformed XML are all
/// returned as errors for the caller to record.
pub async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
    limits: FetchLimits,
) -> Result<Document, FetchError> {
    let bytes = fetch_bytes(client, url, limits).await?;
    Ok(parse_document(&bytes)?)
}

/// Fetch the raw body of one feed.
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    limits: FetchLimits,
) -> Result<Vec<u8>, FetchError> {
    let request = async {
        let response = client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, limits.max_bytes).await
    };

    let bytes = tokio::time::timeout(limits.timeout, request)
        .await
        .map_err(|_| FetchError::Timeout(limits.timeout))??;

    tracing::debug!(feed = %url, bytes = bytes.len(), "Fetched feed");
    Ok(bytes)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: reject on the declared length before reading anything
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
