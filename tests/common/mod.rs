#![allow(dead_code)]

use async_trait::async_trait;
use research_flow::clock::ManualClock;
use research_flow::config::{ExecutionConfig, ResearchConfig, RetryConfig};
use research_flow::error::{EngineError, GenerationError};
use research_flow::models::SearchResult;
use research_flow::tools::{EngineSet, SearchEngine, TextGenerator};
use research_flow::ResearchPipeline;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn search_result(title: &str, url: &str, snippet: &str, score: f64) -> SearchResult {
    SearchResult {
        id: url.to_string(),
        title: title.to_string(),
        url: url.to_string(),
        snippet: snippet.to_string(),
        relevance_score: score,
    }
}

/// Returns the same results for every query.
pub struct StaticEngine {
    results: Vec<SearchResult>,
    calls: AtomicUsize,
}

impl StaticEngine {
    pub fn new(results: Vec<SearchResult>) -> Arc<Self> {
        Arc::new(Self {
            results,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(vec![])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchEngine for StaticEngine {
    async fn search(&self, _query: &str) -> Result<Vec<SearchResult>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.clone())
    }
}

/// Fails every query with a retryable server error.
#[derive(Default)]
pub struct FailingEngine {
    calls: AtomicUsize,
}

impl FailingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchEngine for FailingEngine {
    async fn search(&self, _query: &str) -> Result<Vec<SearchResult>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Server {
            status: 503,
            message: "upstream unavailable".to_string(),
        })
    }
}

/// Answers each stage's prompt with a canned response.
pub struct RoutedGenerator {
    pub plan: String,
    pub synthesis: String,
    pub subtopics: String,
}

#[async_trait]
impl TextGenerator for RoutedGenerator {
    async fn generate(&self, prompt: &str, _temperature: f64) -> Result<String, GenerationError> {
        if prompt.contains("research planner") {
            Ok(self.plan.clone())
        } else if prompt.contains("learnable subtopics") {
            Ok(self.subtopics.clone())
        } else if prompt.contains("synthesizing research") {
            Ok(self.synthesis.clone())
        } else {
            Err(GenerationError::Request("unexpected prompt".to_string()))
        }
    }
}

/// A complete plan with five queries per mandatory engine and one academic.
pub fn plan_json(topic: &str) -> String {
    let mut queries = Vec::new();
    for engine in ["general", "community", "video"] {
        for i in 1..=5 {
            queries.push(serde_json::json!({
                "query": format!("{} {} basics {}", topic, engine, i),
                "engine": engine,
                "reasoning": "baseline coverage",
            }));
        }
    }
    queries.push(serde_json::json!({
        "query": format!("{} research paper", topic),
        "engine": "academic",
        "reasoning": "depth",
    }));
    serde_json::json!({
        "researchQueries": queries,
        "researchStrategy": "broad then deep",
        "expectedOutcomes": ["overview"],
    })
    .to_string()
}

/// Defaults with near-zero backoff so failure paths finish quickly.
pub fn test_config(min_total_results: usize) -> ResearchConfig {
    ResearchConfig {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            max_jitter_ms: 0,
        },
        execution: ExecutionConfig {
            min_total_results,
            ..ExecutionConfig::default()
        },
        ..ResearchConfig::default()
    }
}

pub fn pipeline(
    generator: Arc<dyn TextGenerator>,
    engines: EngineSet,
    config: &ResearchConfig,
) -> ResearchPipeline {
    ResearchPipeline::new(generator, engines, config, Arc::new(ManualClock::default()))
}
