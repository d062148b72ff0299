use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::errors::AppError;
use crate::middleware::metrics::encode_metrics;
use crate::vault::{Retrieval, Revocation};

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSecretRequest {
    /// `"1 hour"`, `"1 day"`, `"1 week"`; anything else is one-time.
    #[serde(default)]
    pub expiration: String,
    pub password: String,
    pub encrypted_data: String,
}

#[derive(Serialize)]
pub struct CreateSecretResponse {
    pub id: String,
}

#[derive(Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Serialize)]
pub struct RetrieveSecretResponse {
    pub encrypted_data: String,
}

/// Unwrap a JSON body, turning an oversized body into a 413 with the limit.
fn json_body<T>(state: &AppState, body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(AppError::PayloadTooLarge {
                limit_mb: state.max_data_size_mb,
            })
        }
        Err(rejection) => Err(AppError::BadRequest(rejection.body_text())),
    }
}

// ── Handlers ─────────────────────────────────────────────────

pub async fn create_secret(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateSecretRequest>, JsonRejection>,
) -> Result<Json<CreateSecretResponse>, AppError> {
    let req = json_body(&state, body)?;
    let id = state
        .service
        .create(&req.expiration, &req.password, req.encrypted_data)
        .await?;
    Ok(Json(CreateSecretResponse { id }))
}

pub async fn retrieve_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<PasswordRequest>, JsonRejection>,
) -> Result<Json<RetrieveSecretResponse>, AppError> {
    let req = json_body(&state, body)?;
    match state.service.retrieve(&id, &req.password).await? {
        Retrieval::Data(encrypted_data) => Ok(Json(RetrieveSecretResponse { encrypted_data })),
        Retrieval::InvalidId => Err(AppError::InvalidId),
        Retrieval::InvalidPassword => Err(AppError::InvalidPassword),
    }
}

pub async fn revoke_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<PasswordRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let req = json_body(&state, body)?;
    match state.service.revoke(&id, &req.password).await? {
        Revocation::Deleted => Ok(StatusCode::NO_CONTENT),
        Revocation::InvalidId => Err(AppError::InvalidId),
        Revocation::InvalidPassword => Err(AppError::InvalidPassword),
    }
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
