//! Runtime configuration.
//!
//! Every field has a default so a bare `ResearchConfig::default()` is usable
//! in tests. `from_env` loads a `.env` file when present and then applies
//! `RESEARCH_FLOW_*` overrides on top of the defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default)]
    pub providers: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub communication: CommunicationConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub tavily_api_key: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results_per_query: u32,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_results() -> u32 {
    5
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            model: default_model(),
            tavily_api_key: None,
            max_results_per_query: default_max_results(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            max_jitter_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationConfig {
    pub max_history: usize,
    pub max_recent_errors: usize,
    pub channel_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Rolling latency above this marks an otherwise healthy agent degraded.
    pub degraded_latency_ms: u64,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            max_history: 1_000,
            max_recent_errors: 10,
            channel_capacity: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            degraded_latency_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningConfig {
    pub temperature: f64,
    pub generation_timeout_ms: u64,
    pub min_queries_per_mandatory_engine: usize,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            generation_timeout_ms: 30_000,
            min_queries_per_mandatory_engine: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub min_total_results: usize,
    pub query_timeout_ms: u64,
    pub run_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_total_results: 5,
            query_timeout_ms: 15_000,
            run_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub temperature: f64,
    pub context_size: usize,
    pub max_insights: usize,
    pub generation_timeout_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            context_size: 20,
            max_insights: 5,
            generation_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub max_depth: u8,
    pub min_confidence: f64,
    pub max_subtopics: usize,
    pub temperature: f64,
    pub generation_timeout_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_confidence: 0.4,
            max_subtopics: 15,
            temperature: 0.3,
            generation_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
        }
    }
}

impl ResearchConfig {
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Failed to load .env file: {}", e);
            }
        }

        let mut config = Self::default();
        config.providers.openai_api_key = env::var("OPENAI_API_KEY").ok();
        config.providers.tavily_api_key = env::var("TAVILY_API_KEY").ok();
        if let Ok(model) = env::var("RESEARCH_FLOW_MODEL") {
            config.providers.model = model;
        }
        if let Ok(addr) = env::var("RESEARCH_FLOW_BIND") {
            config.server.bind_address = addr;
        }

        override_from_env("RESEARCH_FLOW_MAX_ATTEMPTS", &mut config.retry.max_attempts);
        override_from_env("RESEARCH_FLOW_BASE_DELAY_MS", &mut config.retry.base_delay_ms);
        override_from_env("RESEARCH_FLOW_MAX_DELAY_MS", &mut config.retry.max_delay_ms);
        override_from_env(
            "RESEARCH_FLOW_FAILURE_THRESHOLD",
            &mut config.breaker.failure_threshold,
        );
        override_from_env(
            "RESEARCH_FLOW_RESET_TIMEOUT_MS",
            &mut config.breaker.reset_timeout_ms,
        );
        override_from_env(
            "RESEARCH_FLOW_MIN_RESULTS",
            &mut config.execution.min_total_results,
        );
        override_from_env(
            "RESEARCH_FLOW_QUERY_TIMEOUT_MS",
            &mut config.execution.query_timeout_ms,
        );
        override_from_env(
            "RESEARCH_FLOW_RUN_TIMEOUT_MS",
            &mut config.execution.run_timeout_ms,
        );
        override_from_env(
            "RESEARCH_FLOW_MAX_SUBTOPICS",
            &mut config.extraction.max_subtopics,
        );
        override_from_env(
            "RESEARCH_FLOW_MIN_CONFIDENCE",
            &mut config.extraction.min_confidence,
        );
        config
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring unparsable {}={}", key, raw),
        }
    }
}

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: ResearchConfig =
            serde_json::from_str(r#"{"execution": {"min_total_results": 3, "query_timeout_ms": 10, "run_timeout_ms": 100}}"#)
                .unwrap();
        assert_eq!(config.execution.min_total_results, 3);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.providers.model, "gpt-4o-mini");
    }

    #[test]
    fn env_override_parses_numbers() {
        let mut threshold = 5u32;
        env::set_var("RESEARCH_FLOW_TEST_THRESHOLD", "7");
        override_from_env("RESEARCH_FLOW_TEST_THRESHOLD", &mut threshold);
        assert_eq!(threshold, 7);

        env::set_var("RESEARCH_FLOW_TEST_THRESHOLD", "seven");
        override_from_env("RESEARCH_FLOW_TEST_THRESHOLD", &mut threshold);
        assert_eq!(threshold, 7);
    }
}
