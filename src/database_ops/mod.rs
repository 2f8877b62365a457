//! HTTP adapters for the catalog (IGDB) and the streaming platform (Twitch Helix).

pub mod igdb;
pub mod throttle;
pub mod twitch;
pub mod twitch_auth;

use crate::errors::SourceError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::time::Duration;

/// Default wait for a 429 that carries no usable reset header.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Wait derived from `Retry-After` (seconds) or Twitch's `Ratelimit-Reset`
/// (unix seconds).
fn rate_limit_wait(headers: &HeaderMap, now_unix: i64) -> Duration {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(secs) = header("retry-after") {
        return Duration::from_secs(secs.max(0) as u64);
    }
    if let Some(reset) = header("ratelimit-reset") {
        return Duration::from_secs((reset - now_unix).clamp(0, 60) as u64);
    }
    DEFAULT_RATE_LIMIT_WAIT
}

/// Classify a non-success response.
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return SourceError::RateLimited {
            retry_after: rate_limit_wait(headers, chrono::Utc::now().timestamp()),
        };
    }
    if status.is_server_error() {
        return SourceError::transient(format!("status {status}: {body}"));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return SourceError::Auth {
            message: format!("status {status}: {body}"),
        };
    }
    SourceError::Rejected {
        status: status.as_u16(),
        message: body.to_string(),
    }
}
