//! eBird checklist source.
//!
//! Walks the recent-checklist feed of a region, pulls each checklist, and keeps
//! only observations whose breeding code marks singing or courtship.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{get_json, RetryPolicy, SourceBatch};
use crate::error::FetchError;
use crate::models::{whole_seconds, Observation, Source};
use crate::Config;

// ---

const TOKEN_HEADER: &str = "X-eBirdApiToken";

/// Pause between consecutive checklist requests.
const CHECKLIST_PACE: Duration = Duration::from_millis(100);

/// Breeding codes for singing males.
pub const SINGING_CODES: [&str; 4] = ["S", "S1", "S7", "OS"];

/// Breeding codes for courtship or display.
pub const COURTSHIP_CODES: [&str; 3] = ["C", "CC", "D"];

pub fn is_vocal_code(code: &str) -> bool {
    SINGING_CODES.contains(&code) || COURTSHIP_CODES.contains(&code)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistSummary {
    pub sub_id: String,
    pub obs_dt: Option<String>,
    pub iso_obs_date: Option<String>,
    pub loc: Option<SummaryLocation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryLocation {
    pub loc_id: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    pub sub_id: String,
    pub obs_dt: Option<String>,
    pub loc_id: Option<String>,
    pub subnational1_code: Option<String>,
    #[serde(default)]
    pub obs: Vec<ChecklistObservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistObservation {
    pub species_code: Option<String>,
    pub how_many_str: Option<String>,
    #[serde(default)]
    pub obs_aux: Vec<ObservationAux>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationAux {
    pub field_name: Option<String>,
    pub aux_code: Option<String>,
}

impl ChecklistObservation {
    fn breeding_code(&self) -> Option<&str> {
        self.obs_aux
            .iter()
            .find(|aux| aux.field_name.as_deref() == Some("breeding_code"))
            .and_then(|aux| aux.aux_code.as_deref())
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonEntry {
    pub species_code: String,
    pub com_name: String,
    #[serde(default)]
    pub sci_name: String,
}

/// Species code to names, as published by the eBird taxonomy endpoint.
pub type Taxonomy = HashMap<String, TaxonEntry>;

/// Parse the date formats eBird uses across its endpoints.
///
/// Observation times are local to the observer and carry no offset; they are
/// stored as if they were UTC.
pub fn parse_obs_date(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d %b %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Convert one checklist into canonical observations.
///
/// Observations without a singing/courtship code are ignored. Vocal
/// observations that cannot be dated or lack a species code count as malformed.
pub fn normalize_checklist(
    checklist: &Checklist,
    summary_loc: Option<&SummaryLocation>,
    requested_region: &str,
    taxonomy: &Taxonomy,
) -> SourceBatch {
    // ---
    let mut batch = SourceBatch::default();
    let observed_at = checklist.obs_dt.as_deref().and_then(parse_obs_date);

    let region_code = checklist
        .subnational1_code
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(requested_region)
        .to_string();

    let location_id = checklist
        .loc_id
        .clone()
        .or_else(|| summary_loc.and_then(|l| l.loc_id.clone()))
        .unwrap_or_else(|| format!("checklist_{}", checklist.sub_id));

    for obs in &checklist.obs {
        let Some(code) = obs.breeding_code() else {
            continue;
        };
        if !is_vocal_code(code) {
            continue;
        }

        let (Some(species_code), Some(observed_at)) = (
            obs.species_code.as_deref().filter(|s| !s.is_empty()),
            observed_at,
        ) else {
            debug!(
                "Malformed observation in checklist {}: species={:?} obsDt={:?}",
                checklist.sub_id, obs.species_code, checklist.obs_dt
            );
            batch.malformed += 1;
            continue;
        };

        let (common_name, scientific_name) = match taxonomy.get(species_code) {
            Some(taxon) => (taxon.com_name.clone(), taxon.sci_name.clone()),
            None => (species_code.to_string(), String::new()),
        };

        batch.observations.push(Observation {
            source: Source::Ebird,
            species_code: species_code.to_string(),
            common_name,
            scientific_name,
            region_code: region_code.clone(),
            location_id: location_id.clone(),
            latitude: summary_loc.and_then(|l| l.lat),
            longitude: summary_loc.and_then(|l| l.lng),
            observed_at: whole_seconds(observed_at),
            breeding_code: Some(code.to_string()),
            how_many: obs.how_many_str.clone(),
            has_media: false,
        });
    }

    batch
}

/// Client for the eBird 2.0 API.
pub struct EbirdClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_checklists: u32,
    retry: RetryPolicy,
    /// Loaded on the first region and reused for the rest of the run.
    taxonomy: OnceCell<Taxonomy>,
}

impl std::fmt::Debug for EbirdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EbirdClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("max_checklists", &self.max_checklists)
            .finish()
    }
}

impl EbirdClient {
    /// Build the client from configuration.
    ///
    /// # Errors
    /// [`FetchError::ConfigMissing`] when no API key is configured.
    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Self, FetchError> {
        // ---
        let api_key = config
            .ebird_api_key
            .clone()
            .ok_or(FetchError::ConfigMissing("EBIRD_API_KEY"))?;

        Ok(Self {
            http,
            base_url: config.ebird_api_url.trim_end_matches('/').to_string(),
            api_key,
            max_checklists: config.ebird_max_checklists,
            retry: config.retry_policy(),
            taxonomy: OnceCell::new(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}/{}", self.base_url, path);
        get_json(&self.retry, context, || {
            self.http
                .get(&url)
                .header(TOKEN_HEADER, &self.api_key)
                .query(query)
        })
        .await
    }

    pub async fn fetch_taxonomy(&self) -> Result<Taxonomy, FetchError> {
        // ---
        let entries: Vec<TaxonEntry> = self
            .get("taxonomy", "ref/taxonomy/ebird", &[("fmt", "json".to_string())])
            .await?;
        info!("Loaded {} taxonomy entries", entries.len());
        Ok(entries
            .into_iter()
            .map(|t| (t.species_code.clone(), t))
            .collect())
    }

    pub async fn recent_checklists(
        &self,
        region_code: &str,
    ) -> Result<Vec<ChecklistSummary>, FetchError> {
        self.get(
            "checklist feed",
            &format!("product/lists/{region_code}"),
            &[("maxResults", self.max_checklists.to_string())],
        )
        .await
    }

    pub async fn checklist(&self, sub_id: &str) -> Result<Checklist, FetchError> {
        self.get(
            "checklist",
            &format!("product/checklist/view/{sub_id}"),
            &[],
        )
        .await
    }

    /// Fetch vocal observations for `region_code` from checklists dated on or after `since`.
    ///
    /// A failing taxonomy lookup or single checklist is recorded in the batch
    /// and does not abort the region; a failing checklist feed does.
    pub async fn fetch_region(
        &self,
        region_code: &str,
        since: DateTime<Utc>,
    ) -> Result<SourceBatch, FetchError> {
        // ---
        let mut batch = SourceBatch::default();

        // A failed lookup is not cached, so the next region tries again.
        let empty = Taxonomy::new();
        let taxonomy = match self.taxonomy.get_or_try_init(|| self.fetch_taxonomy()).await {
            Ok(t) => t,
            Err(e) => {
                warn!("Taxonomy unavailable, using species codes as names: {}", e);
                batch.errors.push(format!("taxonomy: {e}"));
                &empty
            }
        };

        let summaries = self.recent_checklists(region_code).await?;
        info!("{}: found {} recent checklists", region_code, summaries.len());

        // obsDt is when the birds were seen, not when the checklist was
        // submitted, so compare by date with a day of overlap. The unique key
        // absorbs the re-reads.
        let cutoff = since.date_naive() - ChronoDuration::days(1);

        let mut fetched = 0usize;
        for summary in &summaries {
            let summary_date = summary
                .iso_obs_date
                .as_deref()
                .or(summary.obs_dt.as_deref())
                .and_then(parse_obs_date);
            if matches!(summary_date, Some(d) if d.date_naive() < cutoff) {
                debug!("Skipping checklist {} dated before {}", summary.sub_id, cutoff);
                continue;
            }

            if fetched > 0 {
                tokio::time::sleep(CHECKLIST_PACE).await;
            }
            fetched += 1;

            let checklist = match self.checklist(&summary.sub_id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to fetch checklist {}: {}", summary.sub_id, e);
                    batch.errors.push(format!("checklist {}: {e}", summary.sub_id));
                    continue;
                }
            };

            let part =
                normalize_checklist(&checklist, summary.loc.as_ref(), region_code, taxonomy);
            batch.malformed += part.malformed;
            batch.observations.extend(part.observations);

            if fetched % 50 == 0 {
                info!(
                    "{}: processed {}/{} checklists, {} vocal observations",
                    region_code,
                    fetched,
                    summaries.len(),
                    batch.observations.len()
                );
            }
        }

        info!(
            "{}: {} vocal observations from {} checklists ({} malformed)",
            region_code,
            batch.observations.len(),
            fetched,
            batch.malformed
        );
        Ok(batch)
    }
}
