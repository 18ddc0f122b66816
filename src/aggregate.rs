//! Window counts, trend classification, and the daily rollup.
//!
//! The trend is a plain two-window comparison: no smoothing, no seasonality
//! adjustment, no confidence interval.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::models::{whole_seconds, TrendDirection, TrendRecord};

// ---

/// Default stability threshold in percent.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 10.0;

/// Classify a species from its previous and current window counts.
///
/// Returns the change rounded to two decimals, or `None` when the previous
/// window is empty (`New`). Both boundaries are inclusive: a change of exactly
/// `+threshold` is rising and exactly `-threshold` is falling.
pub fn classify(previous: i64, current: i64, threshold: f64) -> (Option<f64>, TrendDirection) {
    // ---
    if previous <= 0 {
        return (None, TrendDirection::New);
    }

    let change = (current - previous) as f64 * 100.0 / previous as f64;
    let change = (change * 100.0).round() / 100.0;

    let direction = if change >= threshold {
        TrendDirection::Rising
    } else if change <= -threshold {
        TrendDirection::Falling
    } else {
        TrendDirection::Stable
    };

    (Some(change), direction)
}

/// Order trends by absolute change, largest first.
///
/// `New` species have no percentage and sort ahead of everything else; ties
/// fall back to current count and then species code so the order is stable.
pub fn sort_trends(trends: &mut [TrendRecord]) {
    trends.sort_by(|a, b| {
        let key = |t: &TrendRecord| t.change_percent.map_or(f64::INFINITY, f64::abs);
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.current_count.cmp(&a.current_count))
            .then_with(|| a.species_code.cmp(&b.species_code))
    });
}

#[derive(Debug, sqlx::FromRow)]
struct WindowCount {
    species_code: String,
    common_name: String,
    count: i64,
}

/// Per-species counts with `start <= observed_at < end`.
async fn window_counts(
    pool: &SqlitePool,
    region_code: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<WindowCount>, sqlx::Error> {
    // ---
    sqlx::query_as::<_, WindowCount>(
        r#"
        SELECT species_code, MAX(common_name) AS common_name, COUNT(*) AS count
        FROM observations
        WHERE observed_at >= ?1 AND observed_at < ?2
          AND (?3 IS NULL OR region_code = ?3)
        GROUP BY species_code
        "#,
    )
    .bind(start)
    .bind(end)
    .bind(region_code)
    .fetch_all(pool)
    .await
}

/// Compare `[now-W, now)` against `[now-2W, now-W)` for every species seen in either window.
pub async fn compute_trends(
    pool: &SqlitePool,
    region_code: Option<&str>,
    window_days: u32,
    now: DateTime<Utc>,
    threshold: f64,
) -> Result<Vec<TrendRecord>, sqlx::Error> {
    // ---
    let now = whole_seconds(now);
    let window = Duration::days(i64::from(window_days));
    let current_start = now - window;
    let previous_start = current_start - window;

    let current = window_counts(pool, region_code, current_start, now).await?;
    let previous = window_counts(pool, region_code, previous_start, current_start).await?;

    // species_code -> (common_name, previous, current)
    let mut merged: BTreeMap<String, (String, i64, i64)> = BTreeMap::new();
    for row in previous {
        merged.insert(row.species_code, (row.common_name, row.count, 0));
    }
    for row in current {
        let entry = merged
            .entry(row.species_code)
            .or_insert_with(|| (row.common_name.clone(), 0, 0));
        entry.0 = row.common_name;
        entry.2 = row.count;
    }

    let mut trends: Vec<TrendRecord> = merged
        .into_iter()
        .map(|(species_code, (common_name, previous_count, current_count))| {
            let (change_percent, direction) = classify(previous_count, current_count, threshold);
            TrendRecord {
                species_code,
                common_name,
                region_code: region_code.unwrap_or_default().to_string(),
                window_days,
                previous_count,
                current_count,
                change_percent,
                direction,
                period_start: current_start,
                period_end: now,
            }
        })
        .collect();

    sort_trends(&mut trends);
    tracing::debug!(
        "Computed {} trends for region {:?} over {} days",
        trends.len(),
        region_code,
        window_days
    );
    Ok(trends)
}

/// Replace the stored trend snapshot for `(region, window)` in one transaction.
pub async fn store_trends(
    pool: &SqlitePool,
    region_code: Option<&str>,
    window_days: u32,
    trends: &[TrendRecord],
    calculated_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    // ---
    let region = region_code.unwrap_or_default();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM trend_records WHERE region_code = ? AND window_days = ?")
        .bind(region)
        .bind(i64::from(window_days))
        .execute(&mut *tx)
        .await?;

    for trend in trends {
        sqlx::query(
            r#"
            INSERT INTO trend_records (
                species_code, common_name, region_code, window_days,
                period_start, period_end, previous_count, current_count,
                change_percent, direction, calculated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trend.species_code)
        .bind(&trend.common_name)
        .bind(region)
        .bind(i64::from(window_days))
        .bind(trend.period_start)
        .bind(trend.period_end)
        .bind(trend.previous_count)
        .bind(trend.current_count)
        .bind(trend.change_percent)
        .bind(trend.direction.as_str())
        .bind(whole_seconds(calculated_at))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(
        "Stored {} trend records for region {:?} ({} day window)",
        trends.len(),
        region,
        window_days
    );
    Ok(trends.len() as u64)
}

/// Compute and store trends in one step, returning what was stored.
pub async fn refresh_trends(
    pool: &SqlitePool,
    region_code: Option<&str>,
    window_days: u32,
    threshold: f64,
) -> Result<Vec<TrendRecord>, sqlx::Error> {
    let now = Utc::now();
    let trends = compute_trends(pool, region_code, window_days, now, threshold).await?;
    store_trends(pool, region_code, window_days, &trends, now).await?;
    Ok(trends)
}

/// Drop and rebuild the per-day rollup from the observation table.
pub async fn rebuild_daily_summaries(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM daily_summaries")
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query(
        r#"
        INSERT INTO daily_summaries (day, region_code, species_code, common_name, source, count)
        SELECT date(observed_at), region_code, species_code, MAX(common_name), source, COUNT(*)
        FROM observations
        GROUP BY date(observed_at), region_code, species_code, source
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!("Rebuilt daily summaries: {} rows", result.rows_affected());
    Ok(result.rows_affected())
}

/// Number of trends per direction, for run summaries.
pub fn direction_counts(trends: &[TrendRecord]) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for trend in trends {
        *counts.entry(trend.direction.as_str()).or_insert(0) += 1;
    }
    counts
}
