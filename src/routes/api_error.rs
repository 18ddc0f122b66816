//! Typed error for HTTP handlers.
//!
//! Handlers return `Result<Json<T>, ApiError>`; the error renders as
//! `{"error": "message"}` with a matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug)]
pub enum ApiError {
    /// 400: invalid query parameter or body.
    BadRequest(String),
    /// 500: details are logged, never returned to the caller.
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

// ---

/// Upper bound for any `days` parameter.
pub const MAX_DAYS: i64 = crate::config::MAX_DAYS as i64;

/// Validate a `days` parameter: positive and at most [`MAX_DAYS`].
pub fn days_param(value: Option<i64>, default: u32) -> Result<u32, ApiError> {
    // ---
    let Some(days) = value else {
        return Ok(default);
    };
    if days <= 0 || days > MAX_DAYS {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {MAX_DAYS}, got {days}"
        )));
    }
    Ok(days as u32)
}

/// Validate a `limit` parameter: positive.
pub fn limit_param(value: Option<i64>, default: u32) -> Result<u32, ApiError> {
    match value {
        None => Ok(default),
        Some(limit) if limit > 0 => Ok(u32::try_from(limit).unwrap_or(u32::MAX)),
        Some(limit) => Err(ApiError::BadRequest(format!(
            "limit must be positive, got {limit}"
        ))),
    }
}

/// Treat a blank string parameter as absent.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
