//! Admin endpoints that trigger a fetch run or a trend recomputation.
//!
//! Both accept an optional JSON body; an empty body means "use the configured
//! defaults".

use std::collections::HashMap;

use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use super::api_error::{days_param, non_blank, ApiError};
use super::AppState;
use crate::aggregate;
use crate::pipeline::{self, FetchReport, FetchRequest};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/admin/fetch", post(fetch))
        .route("/api/admin/trends", post(trends))
}

/// Parse an optional JSON body.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

async fn fetch(
    State((pool, config)): State<AppState>,
    body: Bytes,
) -> Result<Json<FetchReport>, ApiError> {
    // ---
    let mut request: FetchRequest = json_body(&body)?;
    request.days = request
        .days
        .map(|days| days_param(Some(i64::from(days)), days))
        .transpose()?;
    info!("POST /api/admin/fetch {:?}", request);

    let report = pipeline::run_fetch(&pool, &config, &request).await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
struct TrendsRequest {
    region_code: Option<String>,
    days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TrendsResponse {
    region_code: Option<String>,
    window_days: u32,
    stored: usize,
    directions: HashMap<&'static str, usize>,
}

async fn trends(
    State((pool, config)): State<AppState>,
    body: Bytes,
) -> Result<Json<TrendsResponse>, ApiError> {
    // ---
    let request: TrendsRequest = json_body(&body)?;
    let region_code = non_blank(request.region_code);
    let window_days = days_param(request.days, 7)?;
    info!(
        "POST /api/admin/trends region={:?} days={}",
        region_code, window_days
    );

    let trends = aggregate::refresh_trends(
        &pool,
        region_code.as_deref(),
        window_days,
        config.trend_threshold_percent,
    )
    .await?;

    Ok(Json(TrendsResponse {
        region_code,
        window_days,
        stored: trends.len(),
        directions: aggregate::direction_counts(&trends),
    }))
}
