// src/ingest/error.rs
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;

use crate::ingest::types::SourceKind;

/// Failures on the network-facing side of ingestion.
///
/// Transport failures (`Timeout`, `Network`, `Server`, `RateLimited`, `Malformed`)
/// are retryable; everything else fails immediately.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("rate limited (HTTP 429), retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("client error: HTTP {0}")]
    Client(u16),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("no connector registered for source kind `{0}`")]
    UnsupportedKind(SourceKind),

    #[error("unknown or disabled source `{0}`")]
    UnknownSource(String),
}

impl IngestError {
    /// Map a non-2xx status to the taxonomy.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        match status.as_u16() {
            429 => Self::RateLimited { retry_after },
            s if status.is_server_error() => Self::Server(s),
            s => Self::Client(s),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Network(_)
                | Self::Server(_)
                | Self::RateLimited { .. }
                | Self::Malformed(_)
        )
    }

    /// Server-suggested wait, only ever present on a 429.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Network(e)
        }
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn a response into `Err` unless its status is 2xx.
pub fn check_status(resp: &reqwest::Response) -> Result<(), IngestError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    Err(IngestError::from_status(
        status,
        retry_after_header(resp.headers()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_classification() {
        assert!(matches!(
            IngestError::from_status(StatusCode::TOO_MANY_REQUESTS, None),
            IngestError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            IngestError::from_status(StatusCode::BAD_GATEWAY, None),
            IngestError::Server(502)
        ));
        assert!(matches!(
            IngestError::from_status(StatusCode::UNAUTHORIZED, None),
            IngestError::Client(401)
        ));
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(IngestError::Server(503).is_retryable());
        assert!(IngestError::Timeout.is_retryable());
        assert!(IngestError::RateLimited { retry_after: None }.is_retryable());
        assert!(IngestError::Malformed("x".into()).is_retryable());
        assert!(!IngestError::Client(400).is_retryable());
        assert!(!IngestError::Client(404).is_retryable());
        assert!(!IngestError::UnknownSource("x".into()).is_retryable());
        assert!(!IngestError::UnsupportedKind(SourceKind::Web).is_retryable());
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
        assert_eq!(retry_after_header(&h), Some(Duration::from_secs(7)));

        h.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_header(&h), None);
    }
}
