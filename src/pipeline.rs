//! One fetch run: every requested source against every requested region.
//!
//! Regions and sources are processed sequentially. A failure is confined to
//! its (source, region) pair: it is logged, recorded as a failed fetch run,
//! and reported, while already-committed rows stay in place. The daily
//! rollup is rebuilt once at the end.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::aggregate;
use crate::config::MAX_DAYS;
use crate::error::FetchError;
use crate::fetch::{EbirdClient, INatSoundsClient, SourceAdapter};
use crate::models::Source;
use crate::store::{self, FetchRunRecord};
use crate::Config;

// ---

/// What to fetch. Empty lists and a missing `days` fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub regions: Vec<String>,
    pub days: Option<u32>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl FetchRequest {
    /// Requested regions, upper-cased, or the configured defaults.
    pub fn regions_or(&self, defaults: &[String]) -> Vec<String> {
        // ---
        let regions: Vec<String> = self
            .regions
            .iter()
            .map(|r| r.trim().to_ascii_uppercase())
            .filter(|r| !r.is_empty())
            .collect();

        if regions.is_empty() {
            defaults.to_vec()
        } else {
            regions
        }
    }

    /// Requested sources without duplicates, or every source.
    pub fn sources_or_all(&self) -> Vec<Source> {
        // ---
        if self.sources.is_empty() {
            return Source::ALL.to_vec();
        }
        let mut sources = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            if !sources.contains(source) {
                sources.push(*source);
            }
        }
        sources
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
}

/// Result of fetching one source for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionOutcome {
    pub source: Source,
    pub region_code: String,
    pub status: RunStatus,
    pub inserted: u64,
    pub skipped: u64,
    pub malformed: u64,
    /// The error that aborted this pair, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal problems (a single checklist, one archive).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RegionOutcome {
    fn failed(source: Source, region_code: &str, err: &FetchError) -> Self {
        Self {
            source,
            region_code: region_code.to_string(),
            status: RunStatus::Failed,
            inserted: 0,
            skipped: 0,
            malformed: 0,
            error: Some(err.to_string()),
            warnings: Vec::new(),
        }
    }
}

/// Everything a fetch run did, returned to the caller and logged.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub regions: Vec<String>,
    pub days: u32,
    pub inserted: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub failed: usize,
    /// Rows in the rebuilt daily rollup.
    pub summary_rows: u64,
    pub outcomes: Vec<RegionOutcome>,
}

impl FetchReport {
    fn new(regions: Vec<String>, days: u32) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            regions,
            days,
            inserted: 0,
            skipped: 0,
            malformed: 0,
            failed: 0,
            summary_rows: 0,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, outcome: RegionOutcome) {
        self.inserted += outcome.inserted;
        self.skipped += outcome.skipped;
        self.malformed += outcome.malformed;
        if outcome.status == RunStatus::Failed {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn log_summary(&self) {
        // ---
        info!(
            "Fetch run finished in {}s: {} inserted, {} skipped, {} malformed, {} failed",
            (self.finished_at - self.started_at).num_seconds(),
            self.inserted,
            self.skipped,
            self.malformed,
            self.failed
        );
        for outcome in self.outcomes.iter().filter(|o| o.status == RunStatus::Failed) {
            warn!(
                "  {} {}: {}",
                outcome.source,
                outcome.region_code,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

// ---

/// HTTP client shared by every adapter in a run.
pub fn http_client(config: &Config) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.http_timeout())
        .user_agent(concat!("bloomingsongs/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Build the adapter for `source`; a missing credential only disables that source.
pub fn build_adapter(
    source: Source,
    config: &Config,
    http: reqwest::Client,
) -> Result<SourceAdapter, FetchError> {
    match source {
        Source::Ebird => EbirdClient::from_config(config, http).map(SourceAdapter::Ebird),
        Source::INatSounds => Ok(SourceAdapter::INatSounds(INatSoundsClient::from_config(
            config, http,
        ))),
    }
}

/// Run a fetch with adapters built from configuration.
pub async fn run_fetch(
    pool: &SqlitePool,
    config: &Config,
    request: &FetchRequest,
) -> anyhow::Result<FetchReport> {
    // ---
    let http = http_client(config)?;
    let adapters = request
        .sources_or_all()
        .into_iter()
        .map(|source| (source, build_adapter(source, config, http.clone())))
        .collect();

    run_with_adapters(pool, config, request, adapters).await
}

/// Run a fetch with the given adapters.
///
/// An adapter that could not be built fails every requested region for its
/// source. Only a failure to rebuild the daily rollup fails the whole run.
pub async fn run_with_adapters(
    pool: &SqlitePool,
    config: &Config,
    request: &FetchRequest,
    adapters: Vec<(Source, Result<SourceAdapter, FetchError>)>,
) -> anyhow::Result<FetchReport> {
    // ---
    let regions = request.regions_or(&config.fetch_regions);
    let days = request.days.unwrap_or(config.fetch_days_back);
    let mut report = FetchReport::new(regions.clone(), days);

    info!(
        "Starting fetch: sources={:?} regions={:?} days={}",
        adapters.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(),
        regions,
        days
    );

    for (source, adapter) in &adapters {
        match adapter {
            Ok(adapter) => {
                for region in &regions {
                    let outcome = fetch_region(pool, adapter, region, days).await;
                    report.push(outcome);
                }
            }
            Err(e) => {
                error!("{} source unavailable: {}", source, e);
                for region in &regions {
                    let now = Utc::now();
                    let outcome = RegionOutcome::failed(*source, region, e);
                    record_outcome(pool, &outcome, now, now).await;
                    report.push(outcome);
                }
            }
        }
    }

    report.summary_rows = aggregate::rebuild_daily_summaries(pool).await?;
    report.finished_at = Utc::now();
    report.log_summary();
    Ok(report)
}

/// Fetch and persist one (source, region) pair, recording the attempt.
async fn fetch_region(
    pool: &SqlitePool,
    adapter: &SourceAdapter,
    region_code: &str,
    days: u32,
) -> RegionOutcome {
    // ---
    let source = adapter.source();
    let started_at = Utc::now();
    let window_start = started_at - Duration::days(i64::from(days.min(MAX_DAYS)));

    let since = match store::last_successful_fetch(pool, source, region_code).await {
        Ok(Some(last)) => last.max(window_start),
        Ok(None) => window_start,
        Err(e) => {
            warn!("Could not read fetch history for {source} {region_code}: {e}");
            window_start
        }
    };
    info!("Fetching {} {} since {}", source, region_code, since);

    let result = async {
        let batch = adapter.fetch_region(region_code, since).await?;
        let saved = store::insert_observations(pool, &batch.observations).await?;
        Ok::<_, FetchError>((batch, saved))
    }
    .await;

    let outcome = match result {
        Ok((batch, saved)) => {
            info!(
                "{} {}: {} inserted, {} already stored, {} malformed",
                source, region_code, saved.inserted, saved.skipped, batch.malformed
            );
            RegionOutcome {
                source,
                region_code: region_code.to_string(),
                status: RunStatus::Ok,
                inserted: saved.inserted,
                skipped: saved.skipped,
                malformed: batch.malformed,
                error: None,
                warnings: batch.errors,
            }
        }
        Err(e) => {
            error!("{} {} failed: {}", source, region_code, e);
            RegionOutcome::failed(source, region_code, &e)
        }
    };

    record_outcome(pool, &outcome, started_at, Utc::now()).await;
    outcome
}

async fn record_outcome(
    pool: &SqlitePool,
    outcome: &RegionOutcome,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) {
    // ---
    let run = FetchRunRecord {
        source: outcome.source,
        region_code: &outcome.region_code,
        started_at,
        finished_at,
        inserted: outcome.inserted,
        skipped: outcome.skipped,
        malformed: outcome.malformed,
        error: outcome.error.as_deref(),
    };
    if let Err(e) = store::record_fetch_run(pool, &run).await {
        warn!(
            "Failed to record fetch run for {} {}: {}",
            outcome.source, outcome.region_code, e
        );
    }
}
