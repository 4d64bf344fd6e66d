use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// Bad input, rejected before any network call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provider refused our client credentials.
    #[error("Gateway authentication failed: {0}")]
    GatewayAuth(String),

    /// The provider declined the request. Terminal for this attempt.
    #[error("Gateway rejected the request: {0}")]
    GatewayRejected(String),

    /// Network failure or timeout talking to a provider. Never a decline.
    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment already in terminal state: {0}")]
    AlreadyTerminal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Integration error: {0}")]
    Integration(String),
}

impl AppError {
    /// Only transport failures may be retried, and only by starting a new
    /// initiation attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Validation(ref msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.as_str()),
            AppError::GatewayAuth(ref msg) => {
                tracing::error!("Gateway auth error: {}", msg);
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable")
            }
            AppError::GatewayRejected(ref msg) => (StatusCode::PAYMENT_REQUIRED, msg.as_str()),
            AppError::Transport(ref msg) => {
                tracing::warn!("Gateway transport error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Payment provider unreachable, please retry")
            }
            AppError::Conflict(ref msg) => (StatusCode::CONFLICT, msg.as_str()),
            AppError::AlreadyTerminal(ref msg) => (StatusCode::CONFLICT, msg.as_str()),
            AppError::Database(ref msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error occurred")
            }
            AppError::NotFound(ref msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden"),
            AppError::BadRequest(ref msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            AppError::Integration(ref msg) => {
                tracing::error!("Integration error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg.as_str())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return AppError::Conflict(format!("Duplicate value: {}", db_err.message()));
            }
        }
        AppError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::GatewayRejected(format!("Unreadable gateway response: {}", err))
        } else {
            AppError::Transport(err.to_string())
        }
    }
}
