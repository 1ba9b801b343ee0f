//! HTTP error handling for the hosted backend.
//!
//! Wraps non-success responses with their status so retry logic can tell
//! transient failures from permanent ones, and converts them into
//! `HoldbackError` at the boundary.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::HoldbackError;

/// Number of attempts for a transient failure, including the first one.
const MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles after each attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Error returned by the backend's HTTP API.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status code, if a response was received
    pub status: Option<reqwest::StatusCode>,
    /// Retry-After header value in seconds, if available
    pub retry_after: Option<u64>,
    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_status(message: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self {
            status: Some(status),
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Server errors are worth retrying. Without a status the request may
    /// already have been applied, so it is not.
    pub fn is_transient(&self) -> bool {
        match self.status {
            Some(status) => status.is_server_error(),
            None => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status.is_some_and(|s| s.as_u16() == 429)
    }

    /// How long to wait before retrying a rate-limited request
    pub fn get_retry_after(&self) -> Option<Duration> {
        if !self.is_rate_limited() {
            return None;
        }
        Some(Duration::from_secs(self.retry_after.unwrap_or(60)))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status.as_u16(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status(),
            retry_after: None,
            message: err.to_string(),
        }
    }
}

impl From<ApiError> for HoldbackError {
    fn from(err: ApiError) -> Self {
        if let Some(duration) = err.get_retry_after() {
            return HoldbackError::RateLimited(duration.as_secs());
        }
        if err.status.is_none() {
            return HoldbackError::Unavailable(err.message);
        }
        HoldbackError::Api(err.to_string())
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// Rate-limited and client errors are returned immediately.
pub async fn execute_with_retry<T, F, Fut>(mut operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && err.is_transient() => {
                tracing::debug!("transient backend error (attempt {attempt}): {err}");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_rate_limited_maps_to_retry_after() {
        let err = ApiError::with_status("slow down", StatusCode::TOO_MANY_REQUESTS)
            .with_retry_after(12);
        assert!(matches!(
            HoldbackError::from(err),
            HoldbackError::RateLimited(12)
        ));

        let err = ApiError::with_status("slow down", StatusCode::TOO_MANY_REQUESTS);
        assert!(matches!(
            HoldbackError::from(err),
            HoldbackError::RateLimited(60)
        ));
    }

    #[test]
    fn test_client_error_is_not_transient() {
        let err = ApiError::with_status("bad column", StatusCode::BAD_REQUEST);
        assert!(!err.is_transient());
        assert!(matches!(HoldbackError::from(err), HoldbackError::Api(_)));
    }

    #[test]
    fn test_connection_error_is_unavailable() {
        let err = ApiError::new("connection refused");
        assert!(!err.is_transient());
        assert!(matches!(
            HoldbackError::from(err),
            HoldbackError::Unavailable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = execute_with_retry(|| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::with_status("oops", StatusCode::BAD_GATEWAY))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), ApiError> = execute_with_retry(|| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::with_status("down", StatusCode::SERVICE_UNAVAILABLE))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), ApiError> = execute_with_retry(|| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::with_status("nope", StatusCode::NOT_FOUND))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_without_a_response() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), ApiError> = execute_with_retry(|| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::new("operation timed out"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
