//! Smoke tests against a running server.
//!
//! Ignored by default; run with `BASE_URL=http://host:port cargo test -- --ignored`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct SpeciesCount {
    species_code: String,
    common_name: String,
    observation_count: i64,
}

#[derive(Debug, Deserialize)]
struct Breakdown {
    ebird: i64,
    inaturalist: i64,
    total: i64,
}

#[derive(Debug, Deserialize)]
struct Current {
    birds: Vec<SpeciesCount>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    total_species: usize,
    sources: Breakdown,
}

#[derive(Debug, Deserialize)]
struct Trend {
    previous_count: i64,
    current_count: i64,
    change_percent: Option<f64>,
    trend_direction: String,
}

#[derive(Debug, Deserialize)]
struct DayCount {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct Historical {
    data: BTreeMap<String, Vec<DayCount>>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

fn base_url() -> String {
    std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn health_endpoint_reports_healthy() -> Result<()> {
    // ---
    let url = format!("{}/api/health", base_url());
    let body: serde_json::Value = Client::new().get(&url).send().await?.json().await?;
    assert_eq!(body["status"], "healthy", "unexpected health body from {url}: {body}");
    Ok(())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn current_endpoint_is_consistent() -> Result<()> {
    // ---
    let url = format!("{}/api/birds/current?days=7&limit=25", base_url());
    let current: Current = Client::new().get(&url).send().await?.json().await?;

    assert!(current.birds.len() <= 25, "Limit filter failed");
    assert_eq!(current.total_species, current.birds.len());
    assert!(current.period_start < current.period_end);
    assert_eq!(
        current.sources.total,
        current.sources.ebird + current.sources.inaturalist
    );

    // Sorted by count, descending
    for pair in current.birds.windows(2) {
        assert!(pair[0].observation_count >= pair[1].observation_count);
    }
    for bird in &current.birds {
        assert!(!bird.species_code.is_empty(), "species_code should not be empty");
        assert!(!bird.common_name.is_empty(), "common_name should not be empty");
    }
    Ok(())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn trend_directions_match_counts() -> Result<()> {
    // ---
    let url = format!("{}/api/birds/trends?days=7&min_observations=0", base_url());
    let trends: Vec<Trend> = Client::new().get(&url).send().await?.json().await?;

    for t in &trends {
        match t.trend_direction.as_str() {
            "new" => {
                assert_eq!(t.previous_count, 0);
                assert!(t.change_percent.is_none());
            }
            "rising" => assert!(t.current_count >= t.previous_count),
            "falling" => assert!(t.current_count <= t.previous_count),
            "stable" => assert!(t.change_percent.is_some()),
            other => panic!("unknown trend direction {other}"),
        }
    }
    Ok(())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn historical_days_stay_in_window() -> Result<()> {
    // ---
    let url = format!("{}/api/birds/historical?days=90", base_url());
    let history: Historical = Client::new().get(&url).send().await?.json().await?;

    let first = history.period_start.date_naive().to_string();
    let last = history.period_end.date_naive().to_string();
    for (day, counts) in &history.data {
        assert!(*day >= first && *day <= last, "{day} outside [{first}, {last}]");
        assert!(counts.iter().all(|c| c.count > 0));
    }
    Ok(())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn unknown_source_is_rejected() -> Result<()> {
    let url = format!("{}/api/birds/current?source=xeno-canto", base_url());
    let response = Client::new().get(&url).send().await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
