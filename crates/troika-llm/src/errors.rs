//! Error classification for the transport layer.
//!
//! Transient errors are retried with backoff; unrecoverable ones (auth, bad
//! request, context window) fail immediately and surface to the agent loop
//! as an error outcome.

use thiserror::Error;

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// 429 from the provider.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Suggested wait from the `retry-after` header, in ms.
        retry_after_ms: u64,
        /// Provider message.
        message: String,
    },

    /// Request or stream timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// 5xx / transient server error.
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// Authentication failure. Unrecoverable.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed request. Unrecoverable.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Context window exceeded. Unrecoverable.
    #[error("context window exceeded: {0}")]
    ContextWindow(String),

    /// Other API error with explicit retryability.
    #[error("api error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Provider message.
        message: String,
        /// Whether the provider marked it retryable.
        retryable: bool,
    },

    /// HTTP client failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config resolution failure (missing env var, unreadable file, cycle).
    #[error("config error: {0}")]
    Config(String),
}

impl LlmError {
    /// Whether the transport layer should retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. }
            | LlmError::Timeout(_)
            | LlmError::Connection(_)
            | LlmError::Server { .. } => true,
            LlmError::Api { retryable, .. } => *retryable,
            LlmError::Http(e) => e.is_timeout() || e.is_connect(),
            LlmError::Auth(_)
            | LlmError::BadRequest(_)
            | LlmError::ContextWindow(_)
            | LlmError::Json(_)
            | LlmError::Config(_) => false,
        }
    }

    /// Short type tag recorded on failed turns.
    pub fn error_type(&self) -> &'static str {
        match self {
            LlmError::RateLimited { .. } => "RateLimited",
            LlmError::Timeout(_) => "Timeout",
            LlmError::Connection(_) => "Connection",
            LlmError::Server { .. } => "ServerError",
            LlmError::Auth(_) => "Auth",
            LlmError::BadRequest(_) => "BadRequest",
            LlmError::ContextWindow(_) => "ContextWindow",
            LlmError::Api { .. } => "ApiError",
            LlmError::Http(_) => "Http",
            LlmError::Json(_) => "Json",
            LlmError::Config(_) => "Config",
        }
    }

    /// Classify an HTTP error status into the right variant.
    pub fn from_status(status: u16, message: String, retry_after_ms: Option<u64>) -> Self {
        match status {
            401 | 403 => LlmError::Auth(message),
            400 if message.to_ascii_lowercase().contains("context") => {
                LlmError::ContextWindow(message)
            }
            400 | 404 | 422 => LlmError::BadRequest(message),
            429 => LlmError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(0),
                message,
            },
            500..=599 => LlmError::Server { status, message },
            _ => LlmError::Api {
                status,
                message,
                retryable: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited { retry_after_ms: 0, message: String::new() }.is_transient());
        assert!(LlmError::Timeout("t".into()).is_transient());
        assert!(LlmError::Server { status: 503, message: String::new() }.is_transient());
        assert!(!LlmError::Auth("no".into()).is_transient());
        assert!(!LlmError::BadRequest("no".into()).is_transient());
        assert!(!LlmError::ContextWindow("no".into()).is_transient());
    }

    #[test]
    fn status_classification() {
        assert_matches::assert_matches!(
            LlmError::from_status(401, "x".into(), None),
            LlmError::Auth(_)
        );
        assert_matches::assert_matches!(
            LlmError::from_status(429, "x".into(), Some(1000)),
            LlmError::RateLimited { retry_after_ms: 1000, .. }
        );
        assert_matches::assert_matches!(
            LlmError::from_status(503, "x".into(), None),
            LlmError::Server { status: 503, .. }
        );
        assert_matches::assert_matches!(
            LlmError::from_status(400, "context length exceeded".into(), None),
            LlmError::ContextWindow(_)
        );
    }
}
