//! Read-only views over the observation store.
//!
//! Every function is stateless and takes the pool explicitly. No matching data
//! is not an error: callers get an empty list or map.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::aggregate;
use crate::models::{
    whole_seconds, DailyTotal, Source, SourceBreakdown, SourceFilter, SourceStats, SpeciesCount,
    SpeciesDayCount, TrendDirection, TrendRecord,
};
use crate::store;

// ---

/// Half-width in degrees of the box around a lat/lon point.
pub const POINT_BOX_DEGREES: f64 = 0.5;

/// `[now - days, now]`, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn ending_at(now: DateTime<Utc>, days: u32) -> Self {
        let end = whole_seconds(now);
        Self {
            start: end - Duration::days(i64::from(days)),
            end,
        }
    }
}

/// Row filter shared by the observation queries.
///
/// A lat/lon point takes precedence over the region code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationFilter {
    pub region_code: Option<String>,
    pub point: Option<(f64, f64)>,
    pub species_code: Option<String>,
    pub source: SourceFilter,
}

impl ObservationFilter {
    pub fn region(region_code: Option<String>) -> Self {
        Self {
            region_code,
            ..Self::default()
        }
    }

    /// Append `WHERE ...` for `window` and this filter.
    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>, window: Window, with_source: bool) {
        // ---
        qb.push(" WHERE observed_at >= ")
            .push_bind(window.start)
            .push(" AND observed_at <= ")
            .push_bind(window.end);

        if let Some((lat, lon)) = self.point {
            qb.push(" AND latitude BETWEEN ")
                .push_bind(lat - POINT_BOX_DEGREES)
                .push(" AND ")
                .push_bind(lat + POINT_BOX_DEGREES)
                .push(" AND longitude BETWEEN ")
                .push_bind(lon - POINT_BOX_DEGREES)
                .push(" AND ")
                .push_bind(lon + POINT_BOX_DEGREES);
        } else if let Some(region) = &self.region_code {
            qb.push(" AND region_code = ").push_bind(region.clone());
        }

        if let Some(species) = &self.species_code {
            qb.push(" AND species_code = ").push_bind(species.clone());
        }

        if with_source {
            if let Some(source) = self.source.source() {
                qb.push(" AND source = ").push_bind(source.to_string());
            }
        }
    }
}

// ---

/// Top species inside a window, plus how the matching rows split by source.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentActivity {
    pub birds: Vec<SpeciesCount>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_species: usize,
    pub sources: SourceBreakdown,
}

/// Species ranked by observation count, most observed first.
pub async fn species_counts(
    pool: &SqlitePool,
    filter: &ObservationFilter,
    window: Window,
    limit: u32,
) -> Result<Vec<SpeciesCount>, sqlx::Error> {
    // ---
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT species_code, MAX(common_name) AS common_name, \
         MAX(scientific_name) AS scientific_name, COUNT(*) AS observation_count \
         FROM observations",
    );
    filter.push_where(&mut qb, window, true);
    qb.push(" GROUP BY species_code ORDER BY observation_count DESC, species_code LIMIT ")
        .push_bind(i64::from(limit));

    qb.build_query_as::<SpeciesCount>().fetch_all(pool).await
}

/// Rows per source family for `filter`, ignoring its source restriction.
pub async fn source_breakdown(
    pool: &SqlitePool,
    filter: &ObservationFilter,
    window: Window,
) -> Result<SourceBreakdown, sqlx::Error> {
    // ---
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT source, COUNT(*) FROM observations");
    filter.push_where(&mut qb, window, false);
    qb.push(" GROUP BY source");

    let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(pool).await?;

    let mut breakdown = SourceBreakdown::default();
    for (source, count) in rows {
        match source.parse::<Source>() {
            Ok(Source::Ebird) => breakdown.ebird += count,
            Ok(Source::INatSounds) => breakdown.inaturalist += count,
            Err(_) => tracing::warn!("Ignoring rows with unknown source '{}'", source),
        }
    }
    breakdown.total = breakdown.ebird + breakdown.inaturalist;
    Ok(breakdown)
}

pub async fn current_activity(
    pool: &SqlitePool,
    filter: &ObservationFilter,
    days: u32,
    limit: u32,
    now: DateTime<Utc>,
) -> Result<CurrentActivity, sqlx::Error> {
    // ---
    let window = Window::ending_at(now, days);
    let birds = species_counts(pool, filter, window, limit).await?;
    let sources = source_breakdown(pool, filter, window).await?;

    Ok(CurrentActivity {
        total_species: birds.len(),
        birds,
        period_start: window.start,
        period_end: window.end,
        sources,
    })
}

/// Most observed species in a region, any source.
pub async fn top_species(
    pool: &SqlitePool,
    region_code: Option<String>,
    days: u32,
    limit: u32,
    now: DateTime<Utc>,
) -> Result<Vec<SpeciesCount>, sqlx::Error> {
    let filter = ObservationFilter::region(region_code);
    species_counts(pool, &filter, Window::ending_at(now, days), limit).await
}

// ---

#[derive(Debug, Clone, PartialEq)]
pub struct TrendQuery {
    pub region_code: Option<String>,
    pub days: u32,
    pub limit: u32,
    /// Skip a species when both window counts are below this.
    pub min_observations: i64,
    /// Serve the last stored snapshot instead of recomputing.
    pub stored: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredTrend {
    species_code: String,
    common_name: String,
    region_code: String,
    window_days: i64,
    previous_count: i64,
    current_count: i64,
    change_percent: Option<f64>,
    direction: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

impl StoredTrend {
    fn into_record(self) -> Option<TrendRecord> {
        // ---
        let direction = match self.direction.parse::<TrendDirection>() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Skipping stored trend for {}: {}", self.species_code, e);
                return None;
            }
        };
        Some(TrendRecord {
            species_code: self.species_code,
            common_name: self.common_name,
            region_code: self.region_code,
            window_days: u32::try_from(self.window_days).unwrap_or_default(),
            previous_count: self.previous_count,
            current_count: self.current_count,
            change_percent: self.change_percent,
            direction,
            period_start: self.period_start,
            period_end: self.period_end,
        })
    }
}

/// Stored trend snapshot for `(region, window)`; empty when never computed.
pub async fn stored_trends(
    pool: &SqlitePool,
    region_code: Option<&str>,
    window_days: u32,
) -> Result<Vec<TrendRecord>, sqlx::Error> {
    // ---
    let rows = sqlx::query_as::<_, StoredTrend>(
        r#"
        SELECT species_code, common_name, region_code, window_days,
               previous_count, current_count, change_percent, direction,
               period_start, period_end
        FROM trend_records
        WHERE region_code = ? AND window_days = ?
        "#,
    )
    .bind(region_code.unwrap_or_default())
    .bind(i64::from(window_days))
    .fetch_all(pool)
    .await?;

    let mut trends: Vec<TrendRecord> = rows
        .into_iter()
        .filter_map(StoredTrend::into_record)
        .collect();
    aggregate::sort_trends(&mut trends);
    Ok(trends)
}

pub async fn trends(
    pool: &SqlitePool,
    query: &TrendQuery,
    threshold: f64,
    now: DateTime<Utc>,
) -> Result<Vec<TrendRecord>, sqlx::Error> {
    // ---
    let region = query.region_code.as_deref();
    let all = if query.stored {
        stored_trends(pool, region, query.days).await?
    } else {
        aggregate::compute_trends(pool, region, query.days, now, threshold).await?
    };

    Ok(all
        .into_iter()
        .filter(|t| {
            t.current_count >= query.min_observations || t.previous_count >= query.min_observations
        })
        .take(query.limit as usize)
        .collect())
}

// ---

/// Per-day species counts keyed by `YYYY-MM-DD`.
#[derive(Debug, Clone, Serialize)]
pub struct Historical {
    pub data: BTreeMap<String, Vec<SpeciesDayCount>>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_days: u32,
    pub sources: SourceBreakdown,
}

#[derive(Debug, sqlx::FromRow)]
struct DayRow {
    day: String,
    species_code: String,
    common_name: String,
    count: i64,
}

pub async fn historical(
    pool: &SqlitePool,
    filter: &ObservationFilter,
    days: u32,
    now: DateTime<Utc>,
) -> Result<Historical, sqlx::Error> {
    // ---
    let window = Window::ending_at(now, days);

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT date(observed_at) AS day, species_code, \
         MAX(common_name) AS common_name, COUNT(*) AS count \
         FROM observations",
    );
    filter.push_where(&mut qb, window, true);
    qb.push(" GROUP BY day, species_code ORDER BY day, count DESC, species_code");

    let rows = qb.build_query_as::<DayRow>().fetch_all(pool).await?;

    let mut data: BTreeMap<String, Vec<SpeciesDayCount>> = BTreeMap::new();
    for row in rows {
        data.entry(row.day).or_default().push(SpeciesDayCount {
            species_code: row.species_code,
            common_name: row.common_name,
            count: row.count,
        });
    }

    Ok(Historical {
        data,
        period_start: window.start,
        period_end: window.end,
        total_days: days,
        sources: source_breakdown(pool, filter, window).await?,
    })
}

/// Per-day totals from the daily rollup, oldest first.
pub async fn daily_totals(
    pool: &SqlitePool,
    region_code: Option<&str>,
    days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<DailyTotal>, sqlx::Error> {
    // ---
    let first_day = Window::ending_at(now, days).start.date_naive();

    sqlx::query_as::<_, DailyTotal>(
        r#"
        SELECT day AS date,
               SUM(count) AS total_observations,
               COUNT(DISTINCT species_code) AS unique_species
        FROM daily_summaries
        WHERE day >= ?1 AND (?2 IS NULL OR region_code = ?2)
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(first_day)
    .bind(region_code)
    .fetch_all(pool)
    .await
}

/// Whole-store statistics for the sources endpoint and the fetch CLI.
pub async fn source_stats(pool: &SqlitePool) -> Result<SourceStats, sqlx::Error> {
    // ---
    let total_observations = store::count_observations(pool, None).await?;
    let ebird_observations = store::count_observations(pool, Some(Source::Ebird)).await?;
    let inaturalist_observations = store::count_observations(pool, Some(Source::INatSounds)).await?;

    let unique_species: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT species_code) FROM observations")
            .fetch_one(pool)
            .await?;

    let regions: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT region_code FROM observations ORDER BY region_code")
            .fetch_all(pool)
            .await?;

    let last_updated: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(fetched_at) FROM observations")
            .fetch_one(pool)
            .await?;

    Ok(SourceStats {
        total_observations,
        ebird_observations,
        inaturalist_observations,
        unique_species,
        regions,
        last_updated,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Observation;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 20, 12, 0, 0).unwrap()
    }

    fn obs(source: Source, species: &str, region: &str, days_ago: i64, n: u32) -> Observation {
        Observation {
            source,
            species_code: species.to_string(),
            common_name: format!("{species} name"),
            scientific_name: format!("{species} sci"),
            region_code: region.to_string(),
            location_id: format!("L{n}"),
            latitude: Some(37.7),
            longitude: Some(-122.4),
            observed_at: now() - Duration::days(days_ago) - Duration::minutes(i64::from(n)),
            breeding_code: None,
            how_many: None,
            has_media: source == Source::INatSounds,
        }
    }

    async fn seeded() -> SqlitePool {
        // ---
        let pool = store::memory_pool().await.unwrap();
        let mut rows = Vec::new();
        for n in 0..3 {
            rows.push(obs(Source::Ebird, "amerob", "US-CA", 1, n));
        }
        rows.push(obs(Source::INatSounds, "amerob", "US-CA", 2, 0));
        rows.push(obs(Source::Ebird, "sonspa", "US-CA", 3, 0));
        rows.push(obs(Source::Ebird, "blujay", "US-NY", 1, 0));
        rows.push(obs(Source::Ebird, "amerob", "US-CA", 100, 0));
        store::insert_observations(&pool, &rows).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_current_activity_ranks_and_breaks_down_by_source() {
        // ---
        let pool = seeded().await;
        let filter = ObservationFilter::region(Some("US-CA".to_string()));

        let current = current_activity(&pool, &filter, 7, 50, now()).await.unwrap();

        let codes: Vec<&str> = current.birds.iter().map(|b| b.species_code.as_str()).collect();
        assert_eq!(codes, vec!["amerob", "sonspa"]);
        assert_eq!(current.birds[0].observation_count, 4);
        assert_eq!(current.total_species, 2);
        assert_eq!(
            current.sources,
            SourceBreakdown { ebird: 4, inaturalist: 1, total: 5 }
        );
    }

    #[tokio::test]
    async fn test_source_filter_does_not_change_breakdown() {
        // ---
        let pool = seeded().await;
        let filter = ObservationFilter {
            region_code: Some("US-CA".to_string()),
            source: SourceFilter::Only(Source::INatSounds),
            ..ObservationFilter::default()
        };

        let current = current_activity(&pool, &filter, 7, 50, now()).await.unwrap();

        assert_eq!(current.birds.len(), 1);
        assert_eq!(current.birds[0].observation_count, 1);
        assert_eq!(current.sources.total, 5);
    }

    #[tokio::test]
    async fn test_point_box_overrides_region() {
        // ---
        let pool = seeded().await;
        let filter = ObservationFilter {
            region_code: Some("US-TX".to_string()),
            point: Some((37.5, -122.0)),
            ..ObservationFilter::default()
        };
        let current = current_activity(&pool, &filter, 7, 50, now()).await.unwrap();
        assert_eq!(current.total_species, 3);

        let far = ObservationFilter {
            point: Some((30.0, -97.0)),
            ..ObservationFilter::default()
        };
        let current = current_activity(&pool, &far, 7, 50, now()).await.unwrap();
        assert!(current.birds.is_empty());
    }

    #[tokio::test]
    async fn test_empty_region_returns_empty_results() {
        // ---
        let pool = seeded().await;
        let filter = ObservationFilter::region(Some("US-AK".to_string()));

        let current = current_activity(&pool, &filter, 7, 50, now()).await.unwrap();
        assert!(current.birds.is_empty());
        assert_eq!(current.sources, SourceBreakdown::default());

        let history = historical(&pool, &filter, 90, now()).await.unwrap();
        assert!(history.data.is_empty());
    }

    #[tokio::test]
    async fn test_historical_only_contains_days_in_window() {
        // ---
        let pool = seeded().await;
        let history = historical(&pool, &ObservationFilter::default(), 90, now())
            .await
            .unwrap();

        assert_eq!(history.total_days, 90);
        let first = history.period_start.date_naive().to_string();
        let last = history.period_end.date_naive().to_string();
        for day in history.data.keys() {
            assert!(day.as_str() >= first.as_str() && day.as_str() <= last.as_str(), "{day}");
        }
        assert!(history.data.contains_key("2025-05-19"));
        assert_eq!(history.data.len(), 3);
    }

    #[tokio::test]
    async fn test_historical_species_filter() {
        // ---
        let pool = seeded().await;
        let filter = ObservationFilter {
            species_code: Some("sonspa".to_string()),
            ..ObservationFilter::default()
        };
        let history = historical(&pool, &filter, 90, now()).await.unwrap();

        assert_eq!(history.data.len(), 1);
        let day = &history.data["2025-05-17"];
        assert_eq!(day[0].species_code, "sonspa");
        assert_eq!(day[0].count, 1);
    }

    #[tokio::test]
    async fn test_daily_totals_come_from_rollup() {
        // ---
        let pool = seeded().await;
        assert!(daily_totals(&pool, None, 30, now()).await.unwrap().is_empty());

        aggregate::rebuild_daily_summaries(&pool).await.unwrap();
        let totals = daily_totals(&pool, Some("US-CA"), 30, now()).await.unwrap();

        let days: Vec<String> = totals.iter().map(|t| t.date.to_string()).collect();
        assert_eq!(days, vec!["2025-05-17", "2025-05-18", "2025-05-19"]);
        assert_eq!(totals[2].total_observations, 3);
        assert_eq!(totals[2].unique_species, 1);
    }

    #[tokio::test]
    async fn test_trends_min_observations_and_stored_snapshot() {
        // ---
        let pool = seeded().await;
        let mut query = TrendQuery {
            region_code: Some("US-CA".to_string()),
            days: 7,
            limit: 50,
            min_observations: 2,
            stored: false,
        };

        let live = trends(&pool, &query, 10.0, now()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].species_code, "amerob");
        assert_eq!(live[0].direction, TrendDirection::New);

        query.stored = true;
        assert!(trends(&pool, &query, 10.0, now()).await.unwrap().is_empty());

        let computed = aggregate::compute_trends(&pool, Some("US-CA"), 7, now(), 10.0)
            .await
            .unwrap();
        aggregate::store_trends(&pool, Some("US-CA"), 7, &computed, now())
            .await
            .unwrap();

        let stored = trends(&pool, &query, 10.0, now()).await.unwrap();
        assert_eq!(stored, live);
    }

    #[tokio::test]
    async fn test_source_stats() {
        // ---
        let pool = seeded().await;
        let stats = source_stats(&pool).await.unwrap();

        assert_eq!(stats.total_observations, 7);
        assert_eq!(stats.ebird_observations, 6);
        assert_eq!(stats.inaturalist_observations, 1);
        assert_eq!(stats.unique_species, 3);
        assert_eq!(stats.regions, vec!["US-CA", "US-NY"]);
        assert!(stats.last_updated.is_some());

        let empty = source_stats(&store::memory_pool().await.unwrap()).await.unwrap();
        assert_eq!(empty.total_observations, 0);
        assert!(empty.last_updated.is_none());
    }
}
