//! Database schema management for `bloomingsongs`.
//!
//! Ensures required tables and indexes exist before serving requests or
//! fetching. Applied once on startup (single gateway call).

use anyhow::Result;
use sqlx::SqlitePool;

// ---

const STATEMENTS: &[&str] = &[
    // Observations from every source. The unique index is the dedup key.
    r#"
    CREATE TABLE IF NOT EXISTS observations (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        source          TEXT    NOT NULL,
        species_code    TEXT    NOT NULL,
        common_name     TEXT    NOT NULL,
        scientific_name TEXT    NOT NULL DEFAULT '',
        region_code     TEXT    NOT NULL,
        location_id     TEXT    NOT NULL,
        latitude        REAL,
        longitude       REAL,
        observed_at     TEXT    NOT NULL,
        breeding_code   TEXT,
        how_many        TEXT,
        has_media       INTEGER NOT NULL DEFAULT 0,
        fetched_at      TEXT    NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_observations_natural_key
        ON observations (source, species_code, region_code, observed_at, location_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_observations_region_date
        ON observations (region_code, observed_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_observations_date_species
        ON observations (observed_at, species_code)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_observations_species
        ON observations (species_code)
    "#,
    // Derived trend snapshots, replaced per (region, window) on every aggregator run.
    r#"
    CREATE TABLE IF NOT EXISTS trend_records (
        species_code   TEXT    NOT NULL,
        common_name    TEXT    NOT NULL,
        region_code    TEXT    NOT NULL,
        window_days    INTEGER NOT NULL,
        period_start   TEXT    NOT NULL,
        period_end     TEXT    NOT NULL,
        previous_count INTEGER NOT NULL,
        current_count  INTEGER NOT NULL,
        change_percent REAL,
        direction      TEXT    NOT NULL,
        calculated_at  TEXT    NOT NULL,
        PRIMARY KEY (species_code, region_code, window_days)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_trend_records_region
        ON trend_records (region_code, window_days)
    "#,
    // Per-day rollup, dropped and rebuilt after every fetch run.
    r#"
    CREATE TABLE IF NOT EXISTS daily_summaries (
        day          TEXT    NOT NULL,
        region_code  TEXT    NOT NULL,
        species_code TEXT    NOT NULL,
        common_name  TEXT    NOT NULL,
        source       TEXT    NOT NULL,
        count        INTEGER NOT NULL,
        PRIMARY KEY (day, region_code, species_code, source)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_daily_summaries_region_day
        ON daily_summaries (region_code, day)
    "#,
    // Audit of fetch attempts; the latest `ok` row bounds the next incremental fetch.
    r#"
    CREATE TABLE IF NOT EXISTS fetch_runs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        source      TEXT    NOT NULL,
        region_code TEXT    NOT NULL,
        started_at  TEXT    NOT NULL,
        finished_at TEXT    NOT NULL,
        status      TEXT    NOT NULL,
        inserted    INTEGER NOT NULL DEFAULT 0,
        skipped     INTEGER NOT NULL DEFAULT 0,
        malformed   INTEGER NOT NULL DEFAULT 0,
        error       TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_fetch_runs_lookup
        ON fetch_runs (source, region_code, status, finished_at)
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        // ---
        let pool = memory_pool().await.unwrap();
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec!["daily_summaries", "fetch_runs", "observations", "trend_records"]
        );
    }
}
