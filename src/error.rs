//! Error types for Scorelink
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// This enum represents all possible errors that can occur
/// in the application. It implements `IntoResponse` to
/// automatically convert errors to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Job creation attempted within the cool-down window (409)
    #[error("A job for this friend code was created too recently")]
    CooldownActive,

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Upstream portal returned its error page or an unexpected response (502)
    #[error("Upstream portal error: {0}")]
    Upstream(String),

    /// Session cookie for the bot account is expired or missing (502)
    #[error("Session cookie expired for account {0}")]
    CookieExpired(String),

    /// Fetch queue is saturated or shut down (503)
    #[error("Fetch queue unavailable: {0}")]
    Queue(String),

    /// Intercepting proxy error (500)
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// A per-stage timeout elapsed (504)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::CooldownActive => (StatusCode::CONFLICT, self.to_string()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::CookieExpired(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Queue(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Proxy(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
