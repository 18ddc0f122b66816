//! iNatSounds bulk-metadata source.
//!
//! Downloads the annotation archives (metadata only, not audio), keeps bird
//! recordings, and maps each recording onto a supported US region by its
//! coordinates. The dataset is a static snapshot, so the lookback window does
//! not apply; re-runs rely on the uniqueness key.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{NaiveDate, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{send_with_retry, RetryPolicy, SourceBatch};
use crate::error::FetchError;
use crate::models::{Observation, Source};
use crate::Config;

// ---

/// Supported regions as (code, min_lat, max_lat, min_lon, max_lon).
///
/// Boxes overlap at shared borders; the first match wins.
pub const REGION_BOXES: [(&str, f64, f64, f64, f64); 8] = [
    ("US-CA", 32.5, 42.0, -124.5, -114.0),
    ("US-NY", 40.5, 45.0, -79.8, -71.8),
    ("US-TX", 25.8, 36.5, -106.7, -93.5),
    ("US-FL", 24.5, 31.0, -87.6, -80.0),
    ("US-WA", 45.5, 49.0, -124.8, -116.9),
    ("US-OR", 42.0, 46.3, -124.6, -116.5),
    ("US-AZ", 31.3, 37.0, -114.8, -109.0),
    ("US-CO", 37.0, 41.0, -109.1, -102.0),
];

/// Map coordinates to a supported region code.
pub fn region_from_coords(lat: Option<f64>, lon: Option<f64>) -> Option<&'static str> {
    let (lat, lon) = (lat?, lon?);
    REGION_BOXES
        .iter()
        .find(|(_, min_lat, max_lat, min_lon, max_lon)| {
            (*min_lat..=*max_lat).contains(&lat) && (*min_lon..=*max_lon).contains(&lon)
        })
        .map(|(code, ..)| *code)
}

#[derive(Debug, Default, Deserialize)]
pub struct SoundsDataset {
    #[serde(default)]
    pub audio: Vec<AudioRecord>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
pub struct AudioRecord {
    pub id: i64,
    pub date: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct Annotation {
    pub audio_id: i64,
    pub category_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Category {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub common_name: Option<String>,
    pub class: Option<String>,
    pub supercategory: Option<String>,
}

impl Category {
    fn is_bird(&self) -> bool {
        self.class.as_deref() == Some("Aves") || self.supercategory.as_deref() == Some("Aves")
    }
}

fn clamp_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

/// Convert a dataset into bird observations inside supported regions.
///
/// Recordings without an annotation, of non-bird taxa, or outside every region
/// box are dropped silently; recordings without a usable date are malformed.
pub fn normalize_dataset(dataset: &SoundsDataset) -> SourceBatch {
    // ---
    let categories: HashMap<i64, &Category> =
        dataset.categories.iter().map(|c| (c.id, c)).collect();
    let annotations: HashMap<i64, i64> = dataset
        .annotations
        .iter()
        .map(|a| (a.audio_id, a.category_id))
        .collect();

    let mut batch = SourceBatch::default();

    for audio in &dataset.audio {
        let Some(category) = annotations
            .get(&audio.id)
            .and_then(|category_id| categories.get(category_id))
        else {
            continue;
        };
        if !category.is_bird() {
            continue;
        }

        let observed_at = audio
            .date
            .as_deref()
            .and_then(|d| d.get(..10))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc());
        let Some(observed_at) = observed_at else {
            debug!("Recording {} has no usable date: {:?}", audio.id, audio.date);
            batch.malformed += 1;
            continue;
        };

        let Some(region_code) = region_from_coords(audio.latitude, audio.longitude) else {
            continue;
        };

        let common_name = category
            .common_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&category.name);

        batch.observations.push(Observation {
            source: Source::INatSounds,
            species_code: format!("inat_{}", clamp_chars(&category.name.replace(' ', "_"), 50)),
            common_name: clamp_chars(common_name, 200),
            scientific_name: clamp_chars(&category.name, 200),
            region_code: region_code.to_string(),
            location_id: format!("inatsounds_{}", audio.id),
            latitude: audio.latitude,
            longitude: audio.longitude,
            observed_at,
            breeding_code: None,
            how_many: Some("1".to_string()),
            has_media: true,
        });
    }

    batch
}

/// Read the dataset from a `.json.tar.gz` archive or a plain `.json` file.
pub fn read_dataset(path: &Path) -> Result<SoundsDataset, FetchError> {
    // ---
    let context = path.display().to_string();
    let file = File::open(path).map_err(|e| FetchError::io(&context, e))?;

    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        return serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|source| FetchError::JsonParse { context, source });
    }

    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(|e| FetchError::io(&context, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| FetchError::io(&context, e))?;
        let is_json = entry
            .path()
            .map(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .unwrap_or(false);
        if !is_json {
            continue;
        }

        let mut raw = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut raw)
            .map_err(|e| FetchError::io(&context, e))?;
        return serde_json::from_slice(&raw)
            .map_err(|source| FetchError::JsonParse { context, source });
    }

    Err(FetchError::EmptyArchive(context))
}

/// Downloads, caches, and normalizes the iNatSounds annotation archives.
pub struct INatSoundsClient {
    http: reqwest::Client,
    urls: Vec<String>,
    cache_dir: PathBuf,
    retry: RetryPolicy,
    loaded: OnceCell<LoadedDataset>,
    load_reported: AtomicBool,
}

/// All archives of one run, normalized once and shared between regions.
#[derive(Debug, Default)]
struct LoadedDataset {
    by_region: HashMap<String, Vec<Observation>>,
    malformed: u64,
    errors: Vec<String>,
}

impl INatSoundsClient {
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        // ---
        Self {
            http,
            urls: config.inatsounds_urls.clone(),
            cache_dir: config.inatsounds_cache_dir.clone(),
            retry: config.retry_policy(),
            loaded: OnceCell::new(),
            load_reported: AtomicBool::new(false),
        }
    }

    /// Local path of the cached copy of `url`.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("dataset.json.tar.gz");
        self.cache_dir.join(name)
    }

    /// Return the cached archive for `url`, downloading it first if absent.
    pub async fn ensure_cached(&self, url: &str) -> Result<PathBuf, FetchError> {
        // ---
        let dest = self.cache_path(url);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            info!("Using cached archive {}", dest.display());
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| FetchError::io(self.cache_dir.display().to_string(), e))?;

        info!("Downloading {}", url);
        let response = send_with_retry(&self.retry, || self.http.get(url)).await?;
        let bytes = response.bytes().await?;

        // Write under a temporary name so an interrupted download is never reused.
        let partial = dest.with_extension("part");
        tokio::fs::write(&partial, &bytes)
            .await
            .map_err(|e| FetchError::io(partial.display().to_string(), e))?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| FetchError::io(dest.display().to_string(), e))?;

        info!("Saved {} bytes to {}", bytes.len(), dest.display());
        Ok(dest)
    }

    async fn load_archive(&self, url: &str) -> Result<SourceBatch, FetchError> {
        let path = self.ensure_cached(url).await?;
        let batch = tokio::task::spawn_blocking(move || {
            read_dataset(&path).map(|dataset| normalize_dataset(&dataset))
        })
        .await??;
        Ok(batch)
    }

    async fn load(&self) -> LoadedDataset {
        // ---
        let started = Utc::now();
        let mut loaded = LoadedDataset::default();

        for url in &self.urls {
            match self.load_archive(url).await {
                Ok(batch) => {
                    info!(
                        "{}: {} bird recordings in supported regions, {} malformed",
                        url,
                        batch.observations.len(),
                        batch.malformed
                    );
                    loaded.malformed += batch.malformed;
                    for obs in batch.observations {
                        loaded
                            .by_region
                            .entry(obs.region_code.clone())
                            .or_default()
                            .push(obs);
                    }
                }
                Err(e) => {
                    warn!("Failed to load archive {}: {}", url, e);
                    loaded.errors.push(format!("{url}: {e}"));
                }
            }
        }

        info!(
            "Loaded {} archives in {}s",
            self.urls.len() - loaded.errors.len(),
            (Utc::now() - started).num_seconds()
        );
        loaded
    }

    /// Recordings for `region_code`.
    ///
    /// Archives are loaded once per client; later regions reuse them.
    /// Fails only when every archive failed to load.
    pub async fn fetch_region(&self, region_code: &str) -> Result<SourceBatch, FetchError> {
        // ---
        let loaded = self.loaded.get_or_init(|| self.load()).await;

        if !self.urls.is_empty() && loaded.errors.len() == self.urls.len() {
            return Err(FetchError::Unavailable(format!(
                "every archive failed ({})",
                loaded.errors.join("; ")
            )));
        }

        let mut batch = SourceBatch {
            observations: loaded.by_region.get(region_code).cloned().unwrap_or_default(),
            ..SourceBatch::default()
        };
        // Malformed records and archive failures belong to the load, not a
        // region: report them with the first region only.
        if !self.load_reported.swap(true, Ordering::Relaxed) {
            batch.malformed = loaded.malformed;
            batch.errors = loaded.errors.clone();
        }
        Ok(batch)
    }
}
