//! Source adapters that pull observations from upstream and normalize them.
//!
//! Each source has its own module converting its payloads into the canonical
//! [`Observation`](crate::models::Observation). [`SourceAdapter`] is the single
//! dispatch point the pipeline talks to.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::FetchError;
use crate::models::{Observation, Source};

pub mod ebird;
pub mod inatsounds;

pub use ebird::EbirdClient;
pub use inatsounds::INatSoundsClient;

// ---

/// Bounded exponential backoff for transient HTTP failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Send a request, retrying transient failures according to `policy`.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed
/// by `send`.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut build: F,
) -> Result<reqwest::Response, FetchError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    // ---
    let mut attempt: u32 = 0;

    loop {
        let err = match attempt_once(build()).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= policy.max_retries {
            return Err(FetchError::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            });
        }

        attempt += 1;
        let delay = policy.delay_for(attempt);
        tracing::warn!(
            "Retry attempt {attempt}/{} after {delay:?}: {err}",
            policy.max_retries
        );
        tokio::time::sleep(delay).await;
    }
}

/// Send once, turning a non-success status into [`FetchError::HttpStatus`].
async fn attempt_once(request: reqwest::RequestBuilder) -> Result<reqwest::Response, FetchError> {
    // ---
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(FetchError::HttpStatus {
        url,
        code: status.as_u16(),
        body: truncate(&body, 200).to_string(),
    })
}

/// GET `url` with retries and decode the JSON body.
pub async fn get_json<T, F>(policy: &RetryPolicy, context: &str, build: F) -> Result<T, FetchError>
where
    T: DeserializeOwned,
    F: FnMut() -> reqwest::RequestBuilder,
{
    let response = send_with_retry(policy, build).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|source| FetchError::JsonParse {
        context: format!("{context} (body: {})", truncate(&body, 200)),
        source,
    })
}

/// Truncates a string to the given maximum length at a char boundary.
pub fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Normalized output of one fetch from one source.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub observations: Vec<Observation>,
    /// Records skipped because a field could not be parsed.
    pub malformed: u64,
    /// Non-fatal failures (a single checklist or archive) collected for the report.
    pub errors: Vec<String>,
}

/// One configured upstream source.
pub enum SourceAdapter {
    Ebird(EbirdClient),
    INatSounds(INatSoundsClient),
}

impl SourceAdapter {
    pub fn source(&self) -> Source {
        match self {
            SourceAdapter::Ebird(_) => Source::Ebird,
            SourceAdapter::INatSounds(_) => Source::INatSounds,
        }
    }

    /// Fetch everything the source has for `region_code` observed after `since`.
    pub async fn fetch_region(
        &self,
        region_code: &str,
        since: DateTime<Utc>,
    ) -> Result<SourceBatch, FetchError> {
        match self {
            SourceAdapter::Ebird(client) => client.fetch_region(region_code, since).await,
            SourceAdapter::INatSounds(client) => client.fetch_region(region_code).await,
        }
    }
}
