//! Typed errors for talking to the upstream data sources.

use thiserror::Error;

/// Errors from fetching, decoding, or persisting source data.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("HTTP status {code} from {url}: {body}")]
    HttpStatus { url: String, code: u16, body: String },
    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
    #[error("JSON parse error in {context}: {source}")]
    JsonParse {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive {0} contains no JSON document")]
    EmptyArchive(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("{0} is not configured")]
    ConfigMissing(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FetchError {
    /// Whether this error is transient and the request should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpRequest(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::HttpStatus { code, .. } => matches!(code, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn status(code: u16) -> FetchError {
        FetchError::HttpStatus {
            url: "http://example.test".to_string(),
            code,
            body: String::new(),
        }
    }

    #[test]
    fn test_transient_statuses() {
        for code in [429, 500, 502, 503, 504] {
            assert!(status(code).is_transient(), "{code} should be retried");
        }
        for code in [400, 401, 403, 404, 422] {
            assert!(!status(code).is_transient(), "{code} should not be retried");
        }
    }

    #[test]
    fn test_exhausted_and_config_errors_are_final() {
        let exhausted = FetchError::RetriesExhausted {
            attempts: 4,
            last: Box::new(status(503)),
        };
        assert!(!exhausted.is_transient());
        assert!(!FetchError::ConfigMissing("EBIRD_API_KEY").is_transient());
    }
}
