//! Error taxonomy for the crawl lifecycle
//!
//! Every failure that escapes a pipeline stage or a user handler is
//! classified here at the engine boundary. The variant decides which
//! lifecycle branch the request takes: retry, session rotation, the
//! failed-request handler, or crawl abort.

use std::time::Duration;

/// Errors raised by pipeline stages and user handlers.
///
/// Handlers may return any `anyhow::Error`, which converts into the
/// default `Retryable` variant. The remaining variants are explicit
/// signals that change how the engine disposes of the request.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Default classification: retry up to `max_request_retries`
    #[error(transparent)]
    Retryable(#[from] anyhow::Error),

    /// Anti-bot detection signal. The session is marked bad (possibly
    /// retired) and the request retries with a fresh session without
    /// consuming a regular retry.
    #[error("session blocked: {0}")]
    Session(String),

    /// A navigation or handler deadline was exceeded
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Skip retries and go straight to the failed-request handler
    #[error("{0}")]
    NonRetryable(String),

    /// Run the failed-request handler, then abort the whole crawl
    #[error("{0}")]
    Critical(String),

    /// Always retry, ignoring `max_request_retries`
    #[error("retry requested: {0}")]
    RetryRequest(String),

    /// No handler matches the request label and no default is registered
    #[error("no route for label {label:?} and no default route registered")]
    MissingRoute { label: Option<String> },

    /// Low-level network failure attributable to the proxy; escalated to
    /// session rotation like `Session`
    #[error("proxy failure: {0}")]
    Proxy(String),
}

impl From<crate::storage::StorageError> for CrawlError {
    fn from(error: crate::storage::StorageError) -> Self {
        Self::Retryable(error.into())
    }
}

/// How the engine disposes of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Count against `retry_count`; reclaim while under the cap
    Retry,
    /// Rotate the session and retry without consuming a regular retry
    RetryWithNewSession,
    /// Retry unconditionally, ignoring the retry cap
    RetryIgnoringCap,
    /// Hand to the failed-request handler and mark handled
    Fail,
    /// Hand to the failed-request handler, mark handled, abort the crawl
    Abort,
}

impl CrawlError {
    /// Shorthand for a `Session` error
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Shorthand for a `NonRetryable` error
    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    /// Shorthand for a `Critical` error
    pub fn critical(msg: impl Into<String>) -> Self {
        Self::Critical(msg.into())
    }

    /// Shorthand for a `RetryRequest` error
    pub fn retry_request(msg: impl Into<String>) -> Self {
        Self::RetryRequest(msg.into())
    }

    /// Classify this error into a lifecycle branch.
    ///
    /// `no_retry` reflects `Request::no_retry`; when set, otherwise
    /// retryable errors fall through to the failed-request handler.
    #[must_use]
    pub fn disposition(&self, no_retry: bool) -> ErrorDisposition {
        match self {
            Self::Session(_) | Self::Proxy(_) => ErrorDisposition::RetryWithNewSession,
            Self::RetryRequest(_) => ErrorDisposition::RetryIgnoringCap,
            Self::NonRetryable(_) => ErrorDisposition::Fail,
            Self::Critical(_) | Self::MissingRoute { .. } => ErrorDisposition::Abort,
            Self::Retryable(_) | Self::Timeout { .. } => {
                if no_retry {
                    ErrorDisposition::Fail
                } else {
                    ErrorDisposition::Retry
                }
            }
        }
    }

    /// True for timeouts, which additionally mark the session bad when
    /// they occurred during navigation
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when this error should count against the session's health
    #[must_use]
    pub fn marks_session_bad(&self) -> bool {
        matches!(self, Self::Session(_) | Self::Proxy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification_is_retryable() {
        let err = CrawlError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.disposition(false), ErrorDisposition::Retry);
        assert_eq!(err.disposition(true), ErrorDisposition::Fail);
    }

    #[test]
    fn test_session_error_rotates_session() {
        let err = CrawlError::session("blocked");
        assert_eq!(err.disposition(false), ErrorDisposition::RetryWithNewSession);
        // no_retry does not bypass session rotation
        assert_eq!(err.disposition(true), ErrorDisposition::RetryWithNewSession);
        assert!(err.marks_session_bad());
    }

    #[test]
    fn test_proxy_error_escalates_to_session_handling() {
        let err = CrawlError::Proxy("tunnel reset".into());
        assert_eq!(err.disposition(false), ErrorDisposition::RetryWithNewSession);
    }

    #[test]
    fn test_critical_and_missing_route_abort() {
        assert_eq!(
            CrawlError::critical("storage gone").disposition(false),
            ErrorDisposition::Abort
        );
        assert_eq!(
            CrawlError::MissingRoute { label: Some("DETAIL".into()) }.disposition(false),
            ErrorDisposition::Abort
        );
    }

    #[test]
    fn test_retry_request_ignores_cap() {
        let err = CrawlError::retry_request("try again");
        assert_eq!(err.disposition(true), ErrorDisposition::RetryIgnoringCap);
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = CrawlError::Timeout {
            operation: "request handler",
            timeout: Duration::from_secs(60),
        };
        assert!(err.is_timeout());
        assert_eq!(err.disposition(false), ErrorDisposition::Retry);
    }
}
