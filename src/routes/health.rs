//! Service info and health check endpoints.
//!
//! `/api/health` touches the database so orchestrators see a broken store as
//! an unhealthy service.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::store;

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    description: &'static str,
}

/// JSON response body for a healthy `/api/health`.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct UnavailableResponse {
    status: &'static str,
    error: &'static str,
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "BloomingSongs API",
        version: env!("CARGO_PKG_VERSION"),
        description: "Bird singing activity and trends from eBird and iNatSounds",
    })
}

/// Handle `GET /api/health`.
///
/// Returns 200 when a trivial query succeeds, 503 otherwise.
async fn health(State((pool, _)): State<AppState>) -> impl IntoResponse {
    // ---
    match store::ping(&pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                timestamp: Utc::now(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(UnavailableResponse {
                    status: "unavailable",
                    error: "database unreachable",
                }),
            )
                .into_response()
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
}
