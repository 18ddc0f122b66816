//! Connection setup and write access to the observation store.
//!
//! Every function takes the pool explicitly; nothing here holds global state.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::models::{whole_seconds, Observation, Source};
use crate::schema;

// ---

/// Rows committed per transaction when saving a batch.
const INSERT_CHUNK: usize = 1000;

/// Open (creating if needed) the SQLite database at `db_url`.
pub async fn connect(db_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    // ---
    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
}

/// Single-connection in-memory store with the schema applied.
///
/// One connection only: every new in-memory connection would otherwise see
/// its own empty database.
pub async fn memory_pool() -> anyhow::Result<SqlitePool> {
    // ---
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    schema::create_schema(&pool).await?;
    Ok(pool)
}

/// Cheap liveness probe used by the health endpoint.
pub async fn ping(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

/// Outcome of saving a batch of observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

/// Insert observations, skipping any whose natural key is already stored.
///
/// The unique index plus `ON CONFLICT DO NOTHING` makes each insert atomic, so
/// overlapping fetch runs cannot create duplicates. Rows are committed in
/// chunks; a failure keeps every chunk committed before it.
pub async fn insert_observations(
    pool: &SqlitePool,
    observations: &[Observation],
) -> Result<InsertOutcome, sqlx::Error> {
    // ---
    let mut outcome = InsertOutcome::default();
    let fetched_at = whole_seconds(Utc::now());

    for chunk in observations.chunks(INSERT_CHUNK) {
        let mut tx = pool.begin().await?;

        for obs in chunk {
            let result = sqlx::query(
                r#"
                INSERT INTO observations (
                    source, species_code, common_name, scientific_name,
                    region_code, location_id, latitude, longitude,
                    observed_at, breeding_code, how_many, has_media, fetched_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (source, species_code, region_code, observed_at, location_id)
                DO NOTHING
                "#,
            )
            .bind(obs.source.as_str())
            .bind(&obs.species_code)
            .bind(&obs.common_name)
            .bind(&obs.scientific_name)
            .bind(&obs.region_code)
            .bind(&obs.location_id)
            .bind(obs.latitude)
            .bind(obs.longitude)
            .bind(whole_seconds(obs.observed_at))
            .bind(&obs.breeding_code)
            .bind(&obs.how_many)
            .bind(obs.has_media)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                outcome.skipped += 1;
            } else {
                outcome.inserted += 1;
            }
        }

        tx.commit().await?;
        tracing::debug!(
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            "Committed observation chunk"
        );
    }

    Ok(outcome)
}

/// Number of stored observations, optionally restricted to one source.
pub async fn count_observations(
    pool: &SqlitePool,
    source: Option<Source>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM observations WHERE (?1 IS NULL OR source = ?1)")
        .bind(source.map(|s| s.as_str()))
        .fetch_one(pool)
        .await
}

/// Finish time of the last successful fetch for `(source, region)`.
pub async fn last_successful_fetch(
    pool: &SqlitePool,
    source: Source,
    region_code: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    // ---
    sqlx::query_scalar(
        r#"
        SELECT MAX(finished_at) FROM fetch_runs
        WHERE source = ? AND region_code = ? AND status = 'ok'
        "#,
    )
    .bind(source.as_str())
    .bind(region_code)
    .fetch_one(pool)
    .await
}

/// One fetch attempt for a source/region pair.
#[derive(Debug, Clone)]
pub struct FetchRunRecord<'a> {
    pub source: Source,
    pub region_code: &'a str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: u64,
    pub skipped: u64,
    pub malformed: u64,
    /// `None` for a successful run.
    pub error: Option<&'a str>,
}

pub async fn record_fetch_run(
    pool: &SqlitePool,
    run: &FetchRunRecord<'_>,
) -> Result<(), sqlx::Error> {
    // ---
    let status = if run.error.is_some() { "failed" } else { "ok" };

    sqlx::query(
        r#"
        INSERT INTO fetch_runs (
            source, region_code, started_at, finished_at, status,
            inserted, skipped, malformed, error
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run.source.as_str())
    .bind(run.region_code)
    .bind(whole_seconds(run.started_at))
    .bind(whole_seconds(run.finished_at))
    .bind(status)
    .bind(run.inserted as i64)
    .bind(run.skipped as i64)
    .bind(run.malformed as i64)
    .bind(run.error)
    .execute(pool)
    .await?;

    Ok(())
}
