//! Bird vocalization activity tracker.
//!
//! Pulls singing/courtship observations from eBird checklists and the
//! iNatSounds recording metadata into one SQLite store, computes per-species
//! trends over rolling windows, and serves current activity, trends and
//! historical series over an Axum JSON API.
//!
//! Module layout:
//! - `config`: environment-driven configuration
//! - `fetch`: per-source adapters plus the retrying HTTP layer
//! - `pipeline`: one fetch run across sources and regions
//! - `aggregate`: trend classification and the daily rollup
//! - `query`: read-only views over the store
//! - `routes`: HTTP gateway

pub mod aggregate;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod routes;
pub mod schema;
pub mod store;

pub use config::Config;

// Re-exported so routes/*.rs and the binaries only need the crate root.
pub use error::FetchError;
pub use models::{
    DailyTotal, Observation, Source, SourceBreakdown, SourceFilter, SourceStats, SpeciesCount,
    SpeciesDayCount, TrendDirection, TrendRecord,
};
pub use pipeline::{FetchReport, FetchRequest};
