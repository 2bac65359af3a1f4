use futures::StreamExt;
use reqwest::header::{
    HeaderName, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::feed::parser::ParseError;
use crate::storage::{CacheValidators, DatabaseError};
use crate::util::UrlError;

/// Default per-feed request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

const USER_AGENT: &str = concat!("feedvault/", env!("CARGO_PKG_VERSION"));

/// Everything that can make one feed's sync fail.
///
/// Failures are per-feed: the scheduler records them in the feed's outcome
/// and moves on. Nothing is retried within a run.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connect, TLS or body-stream failure reported by reqwest
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Response status other than 2xx or 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// No complete response within the per-feed timeout
    #[error("Request timed out")]
    Timeout,
    /// Body could not be parsed as a feed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// Database operation failed while reading or committing items
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
    /// The run was cancelled before this feed finished
    #[error("Cancelled")]
    Cancelled,
    /// The subscription URL is not a usable feed URL
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlError),
    /// Body larger than the 10 MiB cap
    #[error("Response too large")]
    ResponseTooLarge,
    /// Body ended before its advertised Content-Length
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Coarse classification of a [`FetchError`] for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Http,
    Parse,
    Storage,
    Cancelled,
    InvalidUrl,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::ResponseTooLarge
            | FetchError::IncompleteResponse { .. } => ErrorKind::Network,
            FetchError::HttpStatus(_) => ErrorKind::Http,
            FetchError::Parse(_) => ErrorKind::Parse,
            FetchError::Storage(_) => ErrorKind::Storage,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::InvalidUrl(_) => ErrorKind::InvalidUrl,
        }
    }

    /// HTTP status carried by the error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus(code) => Some(*code),
            FetchError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// A 2xx response body together with the validators to send next time.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub validators: CacheValidators,
}

/// Result of a conditional GET.
#[derive(Debug, Clone)]
pub enum FetchResponse {
    /// HTTP 304: the stored items are still current
    NotModified,
    /// New content
    Modified(FetchedBody),
}

/// Build the HTTP client shared by every fetch in a run.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Fetch one feed, reusing cache validators from the previous fetch.
///
/// With `validators = Some(..)` the request carries `If-None-Match` and/or
/// `If-Modified-Since`, and a 304 answer yields [`FetchResponse::NotModified`].
/// Passing `None` forces an unconditional GET.
///
/// The whole exchange, body included, is bounded by `timeout`.
///
/// # Errors
///
/// - [`FetchError::Timeout`] when `timeout` elapses
/// - [`FetchError::Network`] for connection, TLS or redirect-loop failures
/// - [`FetchError::HttpStatus`] for any status other than 2xx/304 (3xx that
///   the client could not follow included)
/// - [`FetchError::ResponseTooLarge`] / [`FetchError::IncompleteResponse`]
///   for bad bodies
///
/// Never touches the database.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    validators: Option<&CacheValidators>,
    timeout: Duration,
) -> Result<FetchResponse, FetchError> {
    tokio::time::timeout(timeout, fetch_conditional(client, url, validators))
        .await
        .map_err(|_| FetchError::Timeout)?
}

async fn fetch_conditional(
    client: &reqwest::Client,
    url: &str,
    validators: Option<&CacheValidators>,
) -> Result<FetchResponse, FetchError> {
    let mut request = client.get(url);
    if let Some(v) = validators {
        if let Some(etag) = &v.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(last_modified) = &v.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
        }
    }

    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::NOT_MODIFIED {
        tracing::debug!(feed = %url, "Not modified");
        return Ok(FetchResponse::NotModified);
    }

    if !status.is_success() {
        return Err(FetchError::HttpStatus(status.as_u16()));
    }

    let header = |name: HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let validators = CacheValidators {
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
    };
    let content_type = header(CONTENT_TYPE);

    let body = read_limited_bytes(response, MAX_FEED_SIZE).await?;
    tracing::debug!(
        feed = %url,
        status = status.as_u16(),
        bytes = body.len(),
        etag = ?validators.etag,
        "Fetched feed body"
    );

    Ok(FetchResponse::Modified(FetchedBody {
        status: status.as_u16(),
        body,
        content_type,
        validators,
    }))
}

/// Drain `response` into memory, refusing bodies over `limit` bytes.
///
/// A body shorter than its advertised Content-Length is an error: a truncated
/// document may still parse, and committing it would archive every item past
/// the cut. The feed is not retried within the run; the next run refetches it.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let advertised = response.content_length();
    if advertised.is_some_and(|len| len > limit as u64) {
        return Err(FetchError::ResponseTooLarge);
    }

    let mut body = Vec::with_capacity(advertised.map_or(0, |len| len as usize));
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if body.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        body.extend_from_slice(&chunk);
    }

    match advertised {
        Some(expected) if (body.len() as u64) < expected => Err(FetchError::IncompleteResponse {
            expected,
            received: body.len(),
        }),
        _ => Ok(body),
    }
}
