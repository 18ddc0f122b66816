//! HTTP gateway: merges the per-area subrouters and attaches shared state.

use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::Config;

mod admin;
mod api_error;
mod birds;
mod health;

/// State shared by every handler.
pub type AppState = (SqlitePool, Config);

// ---

pub fn router(pool: SqlitePool, config: Config) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .merge(birds::router())
        .merge(admin::router())
        .with_state((pool, config))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
