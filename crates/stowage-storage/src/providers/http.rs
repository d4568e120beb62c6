//! Shared plumbing for the HTTP API providers.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use stowage_core::config::TransferConfig;
use stowage_core::error::{AppError, ErrorKind};
use stowage_core::result::AppResult;

use crate::client::{TransferError, TransferResult};

/// Build the HTTP client used for one invocation.
pub fn build_client(config: &TransferConfig) -> AppResult<Client> {
    Client::builder()
        .timeout(config.http_timeout())
        .tls_danger_accept_invalid_certs(!config.verify_tls)
        .build()
        .map_err(|e| AppError::with_source(ErrorKind::Configuration, "Failed to build HTTP client", e))
}

/// Classify a transport failure.
pub fn transport_error(context: &str, err: reqwest::Error) -> TransferError {
    TransferError::recoverable(format!("{context}: {err}"))
}

/// Classify an unexpected HTTP status.
///
/// Throttling and server errors are worth retrying; anything else means
/// the request itself is wrong and repeating it will not help.
pub fn status_error(context: &str, status: StatusCode, body: &str) -> TransferError {
    let message = format!("{context}: HTTP {status}: {}", truncate(body));
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransferError::recoverable(message)
        }
        StatusCode::FORBIDDEN if body.contains("RateLimitExceeded") || body.contains("rateLimitExceeded") => {
            TransferError::recoverable(message)
        }
        s if s.is_server_error() => TransferError::recoverable(message),
        _ => TransferError::fatal(message),
    }
}

/// Run one request within what is left of the time slice.
pub async fn within_slice<T>(
    remaining: Duration,
    context: &str,
    request: impl Future<Output = TransferResult<T>>,
) -> TransferResult<T> {
    tokio::time::timeout(remaining, request)
        .await
        .map_err(|_| TransferError::timeout(format!("{context} ran past the time slice")))?
}

/// Turn a non-success response into an error, reading its body.
pub async fn error_for(context: &str, response: Response) -> TransferError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(context, status, &body)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(300) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Everything but the RFC 3986 unreserved characters.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode one path segment.
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Percent-encode a `/`-separated path, keeping the separators.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// `bytes start-end/total` for a chunk of `len` bytes at `start`.
pub fn content_range(start: u64, len: u64, total: u64) -> String {
    if len == 0 {
        return format!("bytes */{total}");
    }
    format!("bytes {start}-{}/{total}", start + len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify() {
        assert!(!status_error("x", StatusCode::SERVICE_UNAVAILABLE, "").is_fatal());
        assert!(!status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_fatal());
        assert!(status_error("x", StatusCode::UNAUTHORIZED, "").is_fatal());
        assert!(
            !status_error("x", StatusCode::FORBIDDEN, "{\"reason\":\"userRateLimitExceeded\"}")
                .is_fatal()
        );
    }

    #[test]
    fn paths_encode() {
        assert_eq!(encode_path("/My Backups/site"), "My%20Backups/site");
        assert_eq!(encode_segment("a_b.zip"), "a_b.zip");
        assert_eq!(encode_segment("site #2/ü"), "site%20%232%2F%C3%BC");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_times_out_at_slice_end() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        };
        let err = within_slice(Duration::from_secs(1), "Upload", slow)
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::timeout("Upload ran past the time slice"));

        let quick = within_slice(Duration::from_secs(1), "Upload", async { Ok(7) }).await;
        assert_eq!(quick, Ok(7));
    }

    #[test]
    fn ranges() {
        assert_eq!(content_range(0, 10, 100), "bytes 0-9/100");
        assert_eq!(content_range(90, 10, 100), "bytes 90-99/100");
    }
}
