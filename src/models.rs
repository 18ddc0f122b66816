//! Data models for the bird observation pipeline.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// eBird checklists carrying a singing/courtship breeding code.
    Ebird,
    /// iNatSounds bulk recording metadata.
    #[serde(rename = "inatsounds", alias = "inaturalist")]
    INatSounds,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Ebird, Source::INatSounds];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Ebird => "ebird",
            Source::INatSounds => "inatsounds",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ebird" => Ok(Source::Ebird),
            "inatsounds" | "inaturalist" => Ok(Source::INatSounds),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Source filter accepted by the read endpoints.
///
/// `inaturalist` is accepted as an alias for the recording source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFilter {
    #[default]
    All,
    Only(Source),
}

impl SourceFilter {
    /// The stored source value to match, `None` meaning no restriction.
    pub fn source(&self) -> Option<&'static str> {
        match self {
            SourceFilter::All => None,
            SourceFilter::Only(source) => Some(source.as_str()),
        }
    }
}

impl FromStr for SourceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(SourceFilter::All),
            v if v.eq_ignore_ascii_case("all") => Ok(SourceFilter::All),
            v => v.parse::<Source>().map(SourceFilter::Only),
        }
    }
}

/// Canonical observation shape every source adapter normalizes into.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    // ---
    pub source: Source,
    pub species_code: String,
    pub common_name: String,
    pub scientific_name: String,
    pub region_code: String,
    pub location_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub breeding_code: Option<String>,
    pub how_many: Option<String>,
    pub has_media: bool,
}

/// Direction of a species between two consecutive windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
    /// No observations in the previous window, so no percentage exists.
    New,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Rising => "rising",
            TrendDirection::Falling => "falling",
            TrendDirection::Stable => "stable",
            TrendDirection::New => "new",
        }
    }
}

impl FromStr for TrendDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rising" => Ok(TrendDirection::Rising),
            "falling" => Ok(TrendDirection::Falling),
            "stable" => Ok(TrendDirection::Stable),
            "new" => Ok(TrendDirection::New),
            other => Err(format!("unknown trend direction '{other}'")),
        }
    }
}

/// Per-species comparison of the current window against the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRecord {
    // ---
    pub species_code: String,
    pub common_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region_code: String,
    pub window_days: u32,
    pub previous_count: i64,
    pub current_count: i64,
    pub change_percent: Option<f64>,
    #[serde(rename = "trend_direction")]
    pub direction: TrendDirection,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Species with its observation count inside a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpeciesCount {
    pub species_code: String,
    pub common_name: String,
    pub scientific_name: String,
    pub observation_count: i64,
}

/// Count of one species on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesDayCount {
    pub species_code: String,
    pub common_name: String,
    pub count: i64,
}

/// Rows per source family matching a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub ebird: i64,
    pub inaturalist: i64,
    pub total: i64,
}

/// Per-day totals served from the `daily_summaries` rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub total_observations: i64,
    pub unique_species: i64,
}

/// Whole-store statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub total_observations: i64,
    pub ebird_observations: i64,
    pub inaturalist_observations: i64,
    pub unique_species: i64,
    pub regions: Vec<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Drop sub-second precision.
///
/// Timestamps are stored as RFC 3339 text; keeping every value at whole seconds
/// keeps the text form fixed-width so range comparisons in SQL stay correct.
pub fn whole_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}
