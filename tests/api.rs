//! Router tests against an in-memory store.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bloomingsongs::{routes, store, Config, Observation, Source};
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tower::util::ServiceExt; // for `oneshot` method

fn app(pool: SqlitePool) -> Router {
    routes::router(pool, Config::with_defaults("sqlite::memory:"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Should read body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

/// `count` observations of `species`, `days_ago` days back, one minute apart.
fn observations(
    source: Source,
    species: &str,
    region: &str,
    days_ago: i64,
    count: usize,
) -> Vec<Observation> {
    // ---
    let base = Utc::now() - Duration::days(days_ago);
    (0..count)
        .map(|n| Observation {
            source,
            species_code: species.to_string(),
            common_name: format!("{species} common"),
            scientific_name: format!("{species} scientific"),
            region_code: region.to_string(),
            location_id: format!("L{days_ago}-{n}"),
            latitude: Some(37.7),
            longitude: Some(-122.4),
            observed_at: base - Duration::minutes(n as i64),
            breeding_code: Some("S".to_string()),
            how_many: Some("1".to_string()),
            has_media: false,
        })
        .collect()
}

async fn seeded() -> SqlitePool {
    // ---
    let pool = store::memory_pool().await.unwrap();
    let mut rows = Vec::new();
    // 10 in the previous week, 15 in the current one
    rows.extend(observations(Source::Ebird, "amerob", "US-CA", 10, 10));
    rows.extend(observations(Source::Ebird, "amerob", "US-CA", 1, 15));
    rows.extend(observations(Source::INatSounds, "sonspa", "US-CA", 2, 6));
    rows.extend(observations(Source::Ebird, "blujay", "US-NY", 1, 3));
    rows.extend(observations(Source::Ebird, "amerob", "US-CA", 120, 4));
    store::insert_observations(&pool, &rows).await.unwrap();
    pool
}

// ---

#[tokio::test]
async fn test_root_describes_service() {
    let pool = store::memory_pool().await.unwrap();
    let (status, body) = send(app(pool), get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "BloomingSongs API");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_health_reports_store_state() {
    // ---
    let pool = store::memory_pool().await.unwrap();

    let (status, body) = send(app(pool.clone()), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());

    pool.close().await;
    let (status, body) = send(app(pool), get("/api/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unavailable");
}

#[tokio::test]
async fn test_read_endpoint_hides_store_errors() {
    // ---
    let pool = store::memory_pool().await.unwrap();
    pool.close().await;

    let (status, body) = send(app(pool), get("/api/birds/current")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "internal server error");
}

#[tokio::test]
async fn test_current_on_empty_region_is_empty() {
    // ---
    let pool = seeded().await;
    let (status, body) = send(app(pool), get("/api/birds/current?region_code=US-AK")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["birds"], serde_json::json!([]));
    assert_eq!(body["total_species"], 0);
    assert_eq!(body["sources"]["total"], 0);
}

#[tokio::test]
async fn test_current_ranks_species_and_filters_source() {
    // ---
    let pool = seeded().await;

    let (status, body) = send(
        app(pool.clone()),
        get("/api/birds/current?region_code=US-CA&days=7"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["birds"][0]["species_code"], "amerob");
    assert_eq!(body["birds"][0]["observation_count"], 15);
    assert_eq!(body["birds"][1]["species_code"], "sonspa");
    assert_eq!(body["sources"]["ebird"], 15);
    assert_eq!(body["sources"]["inaturalist"], 6);
    assert_eq!(body["sources"]["total"], 21);

    let (status, body) = send(
        app(pool),
        get("/api/birds/current?region_code=US-CA&source=inaturalist"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_species"], 1);
    assert_eq!(body["birds"][0]["species_code"], "sonspa");
}

#[tokio::test]
async fn test_invalid_parameters_are_rejected() {
    // ---
    let pool = seeded().await;

    for uri in [
        "/api/birds/current?source=xeno-canto",
        "/api/birds/historical?source=everything",
        "/api/birds/current?days=0",
        "/api/birds/trends?days=-7",
        "/api/birds/top?limit=0",
        "/api/birds/current?lat=37.7",
    ] {
        let (status, body) = send(app(pool.clone()), get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].is_string(), "{uri}");
    }
}

#[tokio::test]
async fn test_trends_classify_rising_species() {
    // ---
    let pool = seeded().await;
    let (status, body) = send(
        app(pool),
        get("/api/birds/trends?region_code=US-CA&days=7&min_observations=5"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let trends = body.as_array().unwrap();
    assert_eq!(trends.len(), 2);

    // `new` sorts first
    assert_eq!(trends[0]["species_code"], "sonspa");
    assert_eq!(trends[0]["trend_direction"], "new");
    assert!(trends[0]["change_percent"].is_null());

    assert_eq!(trends[1]["species_code"], "amerob");
    assert_eq!(trends[1]["previous_count"], 10);
    assert_eq!(trends[1]["current_count"], 15);
    assert_eq!(trends[1]["change_percent"], 50.0);
    assert_eq!(trends[1]["trend_direction"], "rising");
}

#[tokio::test]
async fn test_stored_trends_follow_admin_refresh() {
    // ---
    let pool = seeded().await;

    let (status, body) = send(app(pool.clone()), get("/api/birds/trends?stored=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));

    let (status, body) = send(
        app(pool.clone()),
        post("/api/admin/trends", r#"{"region_code": "US-CA", "days": 7}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stored"], 2);
    assert_eq!(body["directions"]["rising"], 1);
    assert_eq!(body["directions"]["new"], 1);

    let (status, body) = send(
        app(pool),
        get("/api/birds/trends?region_code=US-CA&stored=true"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_historical_stays_inside_window() {
    // ---
    let pool = seeded().await;
    let (status, body) = send(app(pool), get("/api/birds/historical?region_code=US-CA")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_days"], 90);

    let start = (Utc::now() - Duration::days(90)).date_naive().to_string();
    let data = body["data"].as_object().unwrap();
    assert!(!data.is_empty());
    for day in data.keys() {
        assert!(day.as_str() >= start.as_str(), "{day} before {start}");
    }

    // 120-day-old rows are excluded
    let total: i64 = data
        .values()
        .flat_map(|v| v.as_array().unwrap())
        .map(|c| c["count"].as_i64().unwrap())
        .sum();
    assert_eq!(total, 31);
    assert_eq!(body["sources"]["total"], 31);
}

#[tokio::test]
async fn test_historical_species_filter() {
    // ---
    let pool = seeded().await;
    let (status, body) = send(
        app(pool),
        get("/api/birds/historical?species_code=sonspa&source=inatsounds"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for counts in body["data"].as_object().unwrap().values() {
        for c in counts.as_array().unwrap() {
            assert_eq!(c["species_code"], "sonspa");
        }
    }
    assert_eq!(body["sources"]["inaturalist"], 6);
    assert_eq!(body["sources"]["ebird"], 0);
}

#[tokio::test]
async fn test_top_and_sources() {
    // ---
    let pool = seeded().await;

    let (status, body) = send(app(pool.clone()), get("/api/birds/top?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    let top = body.as_array().unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0]["species_code"], "amerob");

    let (status, body) = send(app(pool), get("/api/birds/sources")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_observations"], 38);
    assert_eq!(body["ebird_observations"], 32);
    assert_eq!(body["inaturalist_observations"], 6);
    assert_eq!(body["unique_species"], 3);
    assert_eq!(body["regions"], serde_json::json!(["US-CA", "US-NY"]));
    assert!(body["last_updated"].is_string());
}

#[tokio::test]
async fn test_daily_reads_rollup() {
    // ---
    let pool = seeded().await;
    bloomingsongs::aggregate::rebuild_daily_summaries(&pool)
        .await
        .unwrap();

    let (status, body) = send(app(pool), get("/api/birds/daily?region_code=US-NY")).await;
    assert_eq!(status, StatusCode::OK);

    let days = body.as_array().unwrap();
    let total: i64 = days
        .iter()
        .map(|d| d["total_observations"].as_i64().unwrap())
        .sum();
    assert_eq!(total, 3);
    assert!(days.iter().all(|d| d["unique_species"] == 1));
}

#[tokio::test]
async fn test_admin_fetch_rejects_bad_body() {
    // ---
    let pool = store::memory_pool().await.unwrap();

    for body in [
        r#"{"days": 0}"#,
        r#"{"regions": ["US-CA"], "days": 4000000000, "sources": ["inatsounds"]}"#,
        r#"{"days": 3651}"#,
    ] {
        let (status, reply) = send(app(pool.clone()), post("/api/admin/fetch", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert!(reply["error"].is_string(), "{body}");
    }

    let (status, _) = send(app(pool), post("/api/admin/fetch", r#"{"sources": ["xeno"]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
