//! Error types shared by the harvester, the aggregator and the source adapters.
//!
//! Library code returns these typed errors so callers can tell a retryable
//! failure from a record-local one. Binaries and the pipeline wrap them in
//! `anyhow` with context.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a remote source (catalog or streaming platform).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Connection reset, timeout, 5xx. Retry with backoff.
    #[error("transient network error: {message}")]
    TransientNetwork { message: String },

    /// HTTP 429 or an exhausted rate-limit header. Retry after the mandated wait.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The requested offset is above what the source accepts. Inside the
    /// harvester this means a partition was too wide to page through.
    #[error("offset {offset} exceeds ceiling {ceiling}")]
    OffsetCeilingExceeded { offset: usize, ceiling: usize },

    #[error("page size {requested} exceeds maximum {max}")]
    PageSizeExceeded { requested: usize, max: usize },

    /// Credentials rejected or token could not be obtained.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Any other non-retryable rejection (4xx, unparseable envelope).
    #[error("request rejected (status={status}): {message}")]
    Rejected { status: u16, message: String },
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        SourceError::TransientNetwork {
            message: message.into(),
        }
    }

    /// Whether the harvester may issue the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::TransientNetwork { .. } | SourceError::RateLimited { .. }
        )
    }

    /// Wait mandated by the source, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return SourceError::transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 => SourceError::RateLimited {
                retry_after: Duration::from_secs(1),
            },
            Some(status) if status.is_server_error() => SourceError::transient(err.to_string()),
            Some(status) => SourceError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SourceError::transient(err.to_string()),
        }
    }
}

/// A single record or event that could not be parsed. Never fatal to a run.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed {kind} record: {reason}")]
pub struct MalformedRecord {
    pub kind: &'static str,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Flat-file persistence failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error on {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("bad {column} value in {path} (row {row}): {message}")]
    BadColumn {
        path: String,
        row: usize,
        column: &'static str,
        message: String,
    },
}
