use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::EngineError;
use crate::models::{EngineId, SearchResult};
use crate::research::text::normalize_url;
use crate::tools::engines::{EngineSet, SearchEngine};

const TAVILY_URL: &str = "https://api.tavily.com/search";

#[derive(Debug, Clone, Serialize)]
struct TavilySearchRequest<'a> {
    query: &'a str,
    max_results: u32,
    search_depth: &'static str,
    include_raw_content: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include_domains: Vec<&'static str>,
}

#[derive(Debug, Clone, Deserialize)]
struct TavilySearchResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
}

/// Tavily-backed search scoped to one engine's domains.
#[derive(Debug, Clone)]
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    engine: EngineId,
    max_results: u32,
}

impl TavilySearch {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, engine: EngineId, max_results: u32) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            engine,
            max_results,
        }
    }

    /// One client per engine id, sharing a connection pool.
    pub fn engine_set(config: &ProviderConfig, request_timeout: Duration) -> Result<EngineSet, EngineError> {
        let api_key = config
            .tavily_api_key
            .clone()
            .ok_or_else(|| EngineError::Auth("TAVILY_API_KEY not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let mut engines = EngineSet::new();
        for engine in EngineId::ALL {
            engines.insert(
                engine,
                std::sync::Arc::new(Self::new(
                    client.clone(),
                    api_key.clone(),
                    engine,
                    config.max_results_per_query,
                )),
            );
        }
        Ok(engines)
    }
}

fn engine_domains(engine: EngineId) -> Vec<&'static str> {
    match engine {
        EngineId::General => vec![],
        EngineId::Academic => vec![
            "arxiv.org",
            "scholar.google.com",
            "semanticscholar.org",
            "ncbi.nlm.nih.gov",
            "jstor.org",
        ],
        EngineId::Video => vec!["youtube.com", "vimeo.com", "khanacademy.org", "ted.com"],
        EngineId::Community => vec![
            "reddit.com",
            "stackexchange.com",
            "stackoverflow.com",
            "quora.com",
        ],
        EngineId::Computational => vec!["wolframalpha.com", "mathworld.wolfram.com", "desmos.com"],
    }
}

fn classify_transport(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout(0)
    } else if let Some(status) = e.status() {
        EngineError::from_status(status.as_u16(), e.to_string())
    } else if e.is_decode() {
        EngineError::Parse(e.to_string())
    } else {
        EngineError::Network(e.to_string())
    }
}

/// Ids are stable per engine and page, so the same page found by two
/// queries keeps one id.
fn to_search_result(engine: EngineId, r: TavilyResult) -> SearchResult {
    SearchResult {
        id: format!("{}:{}", engine, normalize_url(&r.url)),
        title: r.title,
        url: r.url,
        snippet: r.content,
        relevance_score: r.score.clamp(0.0, 1.0),
    }
}

#[async_trait]
impl SearchEngine for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, EngineError> {
        let request = TavilySearchRequest {
            query,
            max_results: self.max_results,
            search_depth: "advanced",
            include_raw_content: false,
            include_domains: engine_domains(self.engine),
        };

        let response = self
            .client
            .post(TAVILY_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::from_status(status.as_u16(), body));
        }

        let search_response: TavilySearchResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(format!("Failed to parse response: {}", e)))?;

        debug!(engine = %self.engine, results = search_response.results.len(), "Tavily search completed");

        Ok(search_response
            .results
            .into_iter()
            .map(|r| to_search_result(self.engine, r))
            .collect())
    }
}
