//! Read endpoints under `/api/birds`.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::api_error::{days_param, limit_param, non_blank, ApiError};
use super::AppState;
use crate::query::{self, CurrentActivity, Historical, ObservationFilter, TrendQuery};
use crate::{DailyTotal, SourceFilter, SourceStats, SpeciesCount, TrendRecord};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/birds/current", get(current))
        .route("/api/birds/top", get(top))
        .route("/api/birds/trends", get(trends))
        .route("/api/birds/historical", get(historical))
        .route("/api/birds/daily", get(daily))
        .route("/api/birds/sources", get(sources))
}

fn source_param(value: Option<String>) -> Result<SourceFilter, ApiError> {
    value
        .as_deref()
        .unwrap_or_default()
        .parse::<SourceFilter>()
        .map_err(ApiError::BadRequest)
}

#[derive(Debug, Deserialize)]
struct CurrentParams {
    region_code: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    days: Option<i64>,
    limit: Option<i64>,
    source: Option<String>,
}

async fn current(
    Query(params): Query<CurrentParams>,
    State((pool, _)): State<AppState>,
) -> Result<Json<CurrentActivity>, ApiError> {
    // ---
    debug!("GET /api/birds/current {:?}", params);

    let point = match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "lat and lon must be given together".to_string(),
            ))
        }
    };

    let filter = ObservationFilter {
        region_code: non_blank(params.region_code),
        point,
        species_code: None,
        source: source_param(params.source)?,
    };
    let days = days_param(params.days, 7)?;
    let limit = limit_param(params.limit, 50)?;

    let activity = query::current_activity(&pool, &filter, days, limit, Utc::now()).await?;
    Ok(Json(activity))
}

#[derive(Debug, Deserialize)]
struct TopParams {
    region_code: Option<String>,
    days: Option<i64>,
    limit: Option<i64>,
}

async fn top(
    Query(params): Query<TopParams>,
    State((pool, _)): State<AppState>,
) -> Result<Json<Vec<SpeciesCount>>, ApiError> {
    // ---
    let days = days_param(params.days, 7)?;
    let limit = limit_param(params.limit, 20)?;
    let birds =
        query::top_species(&pool, non_blank(params.region_code), days, limit, Utc::now()).await?;
    Ok(Json(birds))
}

#[derive(Debug, Deserialize)]
struct TrendParams {
    region_code: Option<String>,
    days: Option<i64>,
    limit: Option<i64>,
    min_observations: Option<i64>,
    #[serde(default)]
    stored: bool,
}

async fn trends(
    Query(params): Query<TrendParams>,
    State((pool, config)): State<AppState>,
) -> Result<Json<Vec<TrendRecord>>, ApiError> {
    // ---
    debug!("GET /api/birds/trends {:?}", params);

    let min_observations = params.min_observations.unwrap_or(5);
    if min_observations < 0 {
        return Err(ApiError::BadRequest(format!(
            "min_observations must not be negative, got {min_observations}"
        )));
    }

    let trend_query = TrendQuery {
        region_code: non_blank(params.region_code),
        days: days_param(params.days, 7)?,
        limit: limit_param(params.limit, 50)?,
        min_observations,
        stored: params.stored,
    };

    let trends = query::trends(
        &pool,
        &trend_query,
        config.trend_threshold_percent,
        Utc::now(),
    )
    .await?;
    Ok(Json(trends))
}

#[derive(Debug, Deserialize)]
struct HistoricalParams {
    region_code: Option<String>,
    species_code: Option<String>,
    days: Option<i64>,
    source: Option<String>,
}

async fn historical(
    Query(params): Query<HistoricalParams>,
    State((pool, _)): State<AppState>,
) -> Result<Json<Historical>, ApiError> {
    // ---
    let filter = ObservationFilter {
        region_code: non_blank(params.region_code),
        point: None,
        species_code: non_blank(params.species_code),
        source: source_param(params.source)?,
    };
    let days = days_param(params.days, 90)?;

    let history = query::historical(&pool, &filter, days, Utc::now()).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
struct DailyParams {
    region_code: Option<String>,
    days: Option<i64>,
}

async fn daily(
    Query(params): Query<DailyParams>,
    State((pool, _)): State<AppState>,
) -> Result<Json<Vec<DailyTotal>>, ApiError> {
    // ---
    let region = non_blank(params.region_code);
    let days = days_param(params.days, 30)?;
    let totals = query::daily_totals(&pool, region.as_deref(), days, Utc::now()).await?;
    Ok(Json(totals))
}

async fn sources(State((pool, _)): State<AppState>) -> Result<Json<SourceStats>, ApiError> {
    Ok(Json(query::source_stats(&pool).await?))
}
