//! Application error model with HTTP response mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling, and maps each variant to the appropriate HTTP status and a
//! small JSON body for the API surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the gateway may encounter. API-facing variants
/// map to an HTTP status in [`IntoResponse`]; ingestor-side variants
/// (`Imap`, `AuthFailed`, `Timeout`, `Parse`) are logged and retried and
/// only reach HTTP as 500 if they escape at all.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Missing or wrong admin credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Resource not found (address, message, expired record)
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict (address pool exhausted)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Request rejected by the rate limiter
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Service past its configured expiry date
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// Store (redis) failure; transient from the caller's perspective
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
    /// Upstream IMAP failure (dial, select, fetch)
    #[error("imap error: {0}")]
    Imap(String),
    /// IMAP authentication failure (bad credentials)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Malformed MIME or header content in a single message
    #[error("parse error: {0}")]
    Parse(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status for this error
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → 400
    /// - `Unauthorized` → 401
    /// - `NotFound` → 404
    /// - `Conflict` → 409
    /// - `RateLimited` → 429
    /// - `Unavailable` → 503
    /// - everything else → 500
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_)
            | Self::Imap(_)
            | Self::AuthFailed(_)
            | Self::Timeout(_)
            | Self::Parse(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::AppError;

    #[test]
    fn maps_client_errors_to_4xx() {
        assert_eq!(
            AppError::InvalidInput("bad domain".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("gone".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Conflict("address pool exhausted".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::RateLimited("slow down".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn maps_service_expiry_to_503() {
        assert_eq!(
            AppError::Unavailable("service expired".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn maps_transient_and_internal_to_500() {
        assert_eq!(
            AppError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Timeout("fetch".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
