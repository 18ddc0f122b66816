//! Configuration loader for the `bloomingsongs` backend service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};

use crate::fetch::RetryPolicy;

/// Parse an optional environment variable into `$ty`, falling back to a default.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

pub const DEFAULT_EBIRD_API_URL: &str = "https://api.ebird.org/v2";

/// iNatSounds 2024 annotation archives (metadata only, roughly 22 MB in total).
pub const DEFAULT_INATSOUNDS_URLS: [&str; 3] = [
    "https://ml-inat-competition-datasets.s3.amazonaws.com/sounds/2024/train.json.tar.gz",
    "https://ml-inat-competition-datasets.s3.amazonaws.com/sounds/2024/val.json.tar.gz",
    "https://ml-inat-competition-datasets.s3.amazonaws.com/sounds/2024/test.json.tar.gz",
];

pub const DEFAULT_REGIONS: [&str; 4] = ["US-CA", "US-NY", "US-TX", "US-FL"];

/// Longest lookback or query window accepted anywhere, in days.
pub const MAX_DAYS: u32 = 3650;

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Clone)]
pub struct Config {
    // ---
    /// SQLite connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,

    /// eBird API base URL.
    pub ebird_api_url: String,

    /// eBird API token. The checklist source is unavailable without it.
    pub ebird_api_key: Option<String>,

    /// Maximum number of checklists fetched per region (safety limit).
    pub ebird_max_checklists: u32,

    /// iNatSounds annotation archives to ingest.
    pub inatsounds_urls: Vec<String>,

    /// Directory where downloaded archives are cached.
    pub inatsounds_cache_dir: PathBuf,

    /// Regions fetched when a run does not name any.
    pub fetch_regions: Vec<String>,

    /// Lookback window in days when no earlier successful fetch exists.
    pub fetch_days_back: u32,

    pub http_max_retries: u32,
    pub http_retry_base_ms: u64,
    pub http_timeout_secs: u64,

    /// Percentage change at or beyond which a species counts as rising/falling.
    pub trend_threshold_percent: f64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("db_url", &self.db_url)
            .field("db_pool_max", &self.db_pool_max)
            .field("bind_addr", &self.bind_addr)
            .field("ebird_api_url", &self.ebird_api_url)
            .field("ebird_api_key", &self.ebird_api_key.as_ref().map(|_| "***"))
            .field("ebird_max_checklists", &self.ebird_max_checklists)
            .field("inatsounds_urls", &self.inatsounds_urls)
            .field("inatsounds_cache_dir", &self.inatsounds_cache_dir)
            .field("fetch_regions", &self.fetch_regions)
            .field("fetch_days_back", &self.fetch_days_back)
            .field("http_max_retries", &self.http_max_retries)
            .field("http_retry_base_ms", &self.http_retry_base_ms)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("trend_threshold_percent", &self.trend_threshold_percent)
            .finish()
    }
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – SQLite connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – listen address (default: 0.0.0.0:8080)
/// - `EBIRD_API_URL`, `EBIRD_API_KEY`, `EBIRD_MAX_CHECKLISTS` (default: 200)
/// - `INATSOUNDS_URLS` (comma separated), `INATSOUNDS_CACHE_DIR`
/// - `FETCH_REGIONS` (comma separated), `FETCH_DAYS_BACK` (default: 7, at most [`MAX_DAYS`])
/// - `HTTP_MAX_RETRIES` (default: 3), `HTTP_RETRY_BASE_MS` (default: 500),
///   `HTTP_TIMEOUT_SECS` (default: 30)
/// - `TREND_THRESHOLD_PERCENT` (default: 10.0)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let defaults = Config::with_defaults(db_url);

    let ebird_api_key = env::var("EBIRD_API_KEY")
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());

    let inatsounds_urls = env::var("INATSOUNDS_URLS")
        .ok()
        .map(|v| split_list(&v))
        .unwrap_or(defaults.inatsounds_urls);

    let fetch_regions = env::var("FETCH_REGIONS")
        .ok()
        .map(|v| split_list(&v))
        .unwrap_or(defaults.fetch_regions);

    let trend_threshold_percent =
        parse_env!("TREND_THRESHOLD_PERCENT", f64, defaults.trend_threshold_percent);
    if !trend_threshold_percent.is_finite() || trend_threshold_percent < 0.0 {
        return Err(anyhow!(
            "Invalid TREND_THRESHOLD_PERCENT: {} (must be a non-negative number)",
            trend_threshold_percent
        ));
    }

    let fetch_days_back =
        check_days_back(parse_env!("FETCH_DAYS_BACK", u32, defaults.fetch_days_back))?;

    Ok(Config {
        db_pool_max: parse_env!("DB_POOL_MAX", u32, defaults.db_pool_max),
        bind_addr: parse_env!("BIND_ADDR", SocketAddr, defaults.bind_addr),
        ebird_api_url: env::var("EBIRD_API_URL").unwrap_or(defaults.ebird_api_url),
        ebird_api_key,
        ebird_max_checklists: parse_env!(
            "EBIRD_MAX_CHECKLISTS",
            u32,
            defaults.ebird_max_checklists
        ),
        inatsounds_urls,
        inatsounds_cache_dir: env::var("INATSOUNDS_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.inatsounds_cache_dir),
        fetch_regions,
        fetch_days_back,
        http_max_retries: parse_env!("HTTP_MAX_RETRIES", u32, defaults.http_max_retries),
        http_retry_base_ms: parse_env!("HTTP_RETRY_BASE_MS", u64, defaults.http_retry_base_ms),
        http_timeout_secs: parse_env!("HTTP_TIMEOUT_SECS", u64, defaults.http_timeout_secs),
        trend_threshold_percent,
        db_url: defaults.db_url,
    })
}

fn check_days_back(days: u32) -> Result<u32> {
    if days == 0 || days > MAX_DAYS {
        return Err(anyhow!(
            "Invalid FETCH_DAYS_BACK: {} (must be between 1 and {})",
            days,
            MAX_DAYS
        ));
    }
    Ok(days)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Build a configuration with every optional value at its default.
    pub fn with_defaults(db_url: impl Into<String>) -> Self {
        // ---
        Config {
            db_url: db_url.into(),
            db_pool_max: 5,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ebird_api_url: DEFAULT_EBIRD_API_URL.to_string(),
            ebird_api_key: None,
            ebird_max_checklists: 200,
            inatsounds_urls: DEFAULT_INATSOUNDS_URLS.iter().map(|u| u.to_string()).collect(),
            inatsounds_cache_dir: PathBuf::from("data/inatsounds"),
            fetch_regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            fetch_days_back: 7,
            http_max_retries: 3,
            http_retry_base_ms: 500,
            http_timeout_secs: 30,
            trend_threshold_percent: 10.0,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http_max_retries,
            base_delay: Duration::from_millis(self.http_retry_base_ms),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the eBird API token while showing all other values that were loaded.
    pub fn log_config(&self) {
        // ---
        let masked_key = match &self.ebird_api_key {
            Some(_) => "****",
            None => "<unset, eBird source disabled>",
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL            : {}", self.db_url);
        tracing::info!("  DB_POOL_MAX             : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR               : {}", self.bind_addr);
        tracing::info!("  EBIRD_API_URL           : {}", self.ebird_api_url);
        tracing::info!("  EBIRD_API_KEY           : {}", masked_key);
        tracing::info!("  EBIRD_MAX_CHECKLISTS    : {}", self.ebird_max_checklists);
        tracing::info!("  INATSOUNDS_URLS         : {}", self.inatsounds_urls.len());
        tracing::info!("  INATSOUNDS_CACHE_DIR    : {}", self.inatsounds_cache_dir.display());
        tracing::info!("  FETCH_REGIONS           : {}", self.fetch_regions.join(","));
        tracing::info!("  FETCH_DAYS_BACK         : {}", self.fetch_days_back);
        tracing::info!("  HTTP_MAX_RETRIES        : {}", self.http_max_retries);
        tracing::info!("  HTTP_RETRY_BASE_MS      : {}", self.http_retry_base_ms);
        tracing::info!("  HTTP_TIMEOUT_SECS       : {}", self.http_timeout_secs);
        tracing::info!("  TREND_THRESHOLD_PERCENT : {}", self.trend_threshold_percent);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_split_list_trims_and_drops_empty_entries() {
        assert_eq!(split_list(" US-CA, US-NY ,,US-TX "), vec!["US-CA", "US-NY", "US-TX"]);
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn test_days_back_is_bounded() {
        assert_eq!(check_days_back(7).unwrap(), 7);
        assert_eq!(check_days_back(MAX_DAYS).unwrap(), MAX_DAYS);
        assert!(check_days_back(0).is_err());
        assert!(check_days_back(MAX_DAYS + 1).is_err());
        assert!(check_days_back(4_000_000_000).is_err());
    }

    #[test]
    fn test_defaults() {
        // ---
        let cfg = Config::with_defaults("sqlite::memory:");
        assert_eq!(cfg.db_url, "sqlite::memory:");
        assert_eq!(cfg.fetch_regions, vec!["US-CA", "US-NY", "US-TX", "US-FL"]);
        assert_eq!(cfg.inatsounds_urls.len(), 3);
        assert_eq!(cfg.trend_threshold_percent, 10.0);
        assert!(cfg.ebird_api_key.is_none());

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_debug_masks_api_key() {
        let mut cfg = Config::with_defaults("sqlite::memory:");
        cfg.ebird_api_key = Some("super-secret-token".to_string());
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("***"));
    }
}
