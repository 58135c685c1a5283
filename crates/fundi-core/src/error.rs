//! Classified error taxonomy for backend-facing operations.
//!
//! Every failure that crosses the request wrapper is classified into one of
//! these variants so callers can branch on kind instead of inspecting ad hoc
//! flags. The process-wide handler consults [`ApiError::is_expected`] to keep
//! already-classified failures out of crash reporting.

use thiserror::Error;

/// Result type alias using the classified `ApiError`.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors surfaced by the token manager, request wrapper, and caches.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The refresh token is absent or no longer usable. Upstream treats this
    /// as "log out".
    #[error("Session expired; sign in again")]
    SessionExpired,

    /// Authenticated but not authorized for this role (HTTP 403). Never retried.
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Rate limited (HTTP 429) after the bounded retry was exhausted.
    #[error("Rate limited by the backend; try again shortly")]
    RateLimited,

    /// Backend-caused fault (HTTP 5xx). Not user-actionable.
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Transport-level failure (DNS, TLS, connection reset, timeout).
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Malformed response payload.
    #[error("Failed to parse JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend answered 2xx but the envelope carried `status: "error"`.
    #[error("API error: {0}")]
    Api(String),

    /// Client misconfiguration (bad base URL, missing endpoint).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Device key-value or keychain storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ApiError {
    /// Whether this error is an expected, already-classified condition that
    /// must not be reported as a crash.
    ///
    /// Session expiry triggers the logout flow, server faults and rate limits
    /// are backend-caused; all three are still logged for diagnostics.
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired | Self::Server { .. } | Self::RateLimited
        )
    }
}
