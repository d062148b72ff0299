use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Backend configuration rejected before the store starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration parameter: {0}")]
    Missing(String),

    #[error("unknown configuration parameter: {0}")]
    Unknown(String),

    #[error("invalid configuration parameter {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("unknown storage class: {0}")]
    UnknownBackend(String),
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret already created")]
    AlreadyCreated,

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid secret id")]
    InvalidId,

    #[error("corrupt record {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("backend failed to start: {0}")]
    Start(String),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid secret id")]
    InvalidId,

    #[error("invalid password")]
    InvalidPassword,

    #[error("payload too large")]
    PayloadTooLarge { limit_mb: u64 },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match &self {
            AppError::InvalidId => (StatusCode::NOT_FOUND, "invalid_id", "Invalid ID".to_string()),
            AppError::InvalidPassword => (
                StatusCode::FORBIDDEN,
                "invalid_password",
                "Invalid password.".to_string(),
            ),
            AppError::PayloadTooLarge { limit_mb } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                format!("Maximum file upload size is {} MB", limit_mb),
            ),
            AppError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, "bad_request", reason.clone())
            }
            AppError::Store(e) => {
                tracing::error!("Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "result": msg,
            "code": code,
        }));

        (status, body).into_response()
    }
}
