use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::EngineId;
use crate::resilience::Retryable;

/// Failure of a single engine call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request rejected {status}: {message}")]
    Client { status: u16, message: String },
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("no client registered for engine {0}")]
    NotConfigured(EngineId),
    #[error("circuit open for engine {0}")]
    CircuitOpen(EngineId),
}

impl EngineError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => EngineError::RateLimited,
            401 | 403 => EngineError::Auth(message),
            400..=499 => EngineError::Client { status, message },
            _ => EngineError::Server { status, message },
        }
    }
}

impl Retryable for EngineError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_)
                | EngineError::Timeout(_)
                | EngineError::RateLimited
                | EngineError::Server { .. }
        )
    }
}

/// Failure of the text-generation capability.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum GenerationError {
    #[error("generation unavailable: {0}")]
    Unavailable(String),
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("generation output did not match schema: {0}")]
    Schema(String),
    #[error("generation timed out after {0}ms")]
    Timeout(u64),
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Request(_) | GenerationError::Timeout(_))
    }
}

/// Errors that escape a research stage.
///
/// Serializable so a failed stage can hand it back through the session
/// context and the HTTP layer can report it as-is.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum ResearchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("planning failed: {0}")]
    Planning(String),
    #[error("all {failed} general engine queries failed")]
    CriticalEnginesUnavailable { failed: usize },
    #[error(
        "insufficient coverage: {total} results ({general} general), need at least {minimum} with one general"
    )]
    InsufficientCoverage {
        total: usize,
        general: usize,
        minimum: usize,
    },
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl ResearchError {
    /// Coverage errors mean the result set itself is unusable.
    pub fn is_coverage_failure(&self) -> bool {
        matches!(
            self,
            ResearchError::CriticalEnginesUnavailable { .. }
                | ResearchError::InsufficientCoverage { .. }
        )
    }
}

pub type Result<T, E = ResearchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify() {
        assert_eq!(EngineError::from_status(429, ""), EngineError::RateLimited);
        assert!(EngineError::from_status(429, "").is_retryable());
        assert!(EngineError::from_status(503, "down").is_retryable());
        assert!(!EngineError::from_status(401, "key").is_retryable());
        assert!(!EngineError::from_status(404, "missing").is_retryable());
    }

    #[test]
    fn research_errors_serialize_with_kind() {
        let json = serde_json::to_value(ResearchError::InsufficientCoverage {
            total: 2,
            general: 0,
            minimum: 5,
        })
        .unwrap();
        assert_eq!(json["kind"], "insufficientCoverage");
        assert_eq!(json["detail"]["minimum"], 5);

        let back: ResearchError = serde_json::from_value(json).unwrap();
        assert!(back.is_coverage_failure());
    }

    #[test]
    fn coverage_failures_are_flagged() {
        assert!(ResearchError::CriticalEnginesUnavailable { failed: 5 }.is_coverage_failure());
        assert!(!ResearchError::Planning("x".into()).is_coverage_failure());
    }
}
