use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentCommunicationManager, MessageType};
use crate::config::{millis, ExecutionConfig};
use crate::error::{EngineError, ResearchError, Result};
use crate::models::{EngineId, ResearchPlan, ResearchQuery, SearchResult, SearchResultWithEngine};
use crate::research::text::{normalize_title, normalize_url};
use crate::resilience::{CircuitBreakerManager, RetryPolicy};
use crate::tools::EngineSet;

/// Words dropped when broadening a failed query.
const QUALIFIERS: &[&str] = &[
    "a", "an", "the", "of", "for", "to", "in", "on", "how", "does", "do", "work", "works",
    "advanced", "detailed", "comprehensive", "technical", "explained", "guide", "tutorial",
    "beginner", "beginners", "basics", "introduction", "overview", "video", "lecture",
];

/// Simplified form of a query for the single critical-engine fallback.
pub fn broaden_query(query: &str) -> String {
    let words: Vec<&str> = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty() && !w.contains(':'))
        .filter(|w| !QUALIFIERS.contains(&w.to_lowercase().as_str()))
        .take(4)
        .collect();
    if words.is_empty() {
        query.trim().to_string()
    } else {
        words.join(" ")
    }
}

/// Collapses results sharing a normalized `(title, url)`, keeping the one
/// with the higher relevance score in the position first seen.
pub fn deduplicate(results: Vec<SearchResultWithEngine>) -> Vec<SearchResultWithEngine> {
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    let mut unique: Vec<SearchResultWithEngine> = Vec::with_capacity(results.len());
    for result in results {
        let key = (
            normalize_title(&result.result.title),
            normalize_url(&result.result.url),
        );
        match seen.get(&key) {
            Some(&index) => {
                if result.result.relevance_score > unique[index].result.relevance_score {
                    unique[index] = result;
                }
            }
            None => {
                seen.insert(key, unique.len());
                unique.push(result);
            }
        }
    }
    unique
}

struct QueryOutcome {
    engine: EngineId,
    results: Option<Vec<SearchResultWithEngine>>,
}

pub struct ResearchExecutionModule {
    engines: EngineSet,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryPolicy,
    config: ExecutionConfig,
    comms: Option<Arc<AgentCommunicationManager>>,
}

impl ResearchExecutionModule {
    pub fn new(
        engines: EngineSet,
        breakers: Arc<CircuitBreakerManager>,
        retry: RetryPolicy,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            engines,
            breakers,
            retry,
            config,
            comms: None,
        }
    }

    pub fn with_communication(mut self, comms: Arc<AgentCommunicationManager>) -> Self {
        self.comms = Some(comms);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Runs every planned query concurrently and returns the deduplicated,
    /// coverage-checked result set.
    ///
    /// Specialized engine failures are dropped. The run fails only when every
    /// general query failed or the collected results miss the coverage floor.
    #[instrument(skip(self, plan), fields(queries = plan.research_queries.len()))]
    pub async fn execute_plan(&self, plan: &ResearchPlan) -> Result<Vec<SearchResultWithEngine>> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + millis(self.config.run_timeout_ms);

        let mut pending: FuturesUnordered<_> = plan
            .research_queries
            .iter()
            .map(|query| self.execute_query(query))
            .collect();

        let mut outcomes = Vec::with_capacity(plan.research_queries.len());
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        outstanding = pending.len(),
                        "Run deadline reached, proceeding with collected results"
                    );
                    break;
                }
            }
        }
        drop(pending);

        // Queries still outstanding at the deadline never failed; a run cut
        // short that way ends in the coverage check instead.
        let general_planned = plan.count_for(EngineId::General);
        let general_failed = outcomes
            .iter()
            .filter(|o| o.engine.is_critical() && o.results.is_none())
            .count();
        if general_planned > 0 && general_failed == general_planned {
            self.report_run(false, started, 0);
            return Err(ResearchError::CriticalEnginesUnavailable {
                failed: general_failed,
            });
        }

        let dropped = outcomes.iter().filter(|o| o.results.is_none()).count();
        let collected: Vec<_> = outcomes
            .into_iter()
            .filter_map(|o| o.results)
            .flatten()
            .collect();
        let raw_count = collected.len();
        let results = deduplicate(collected);

        info!(
            raw = raw_count,
            unique = results.len(),
            dropped_queries = dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Plan execution finished"
        );

        if let Err(e) = self.validate_coverage(&results) {
            self.report_run(false, started, results.len());
            return Err(e);
        }
        self.report_run(true, started, results.len());
        Ok(results)
    }

    pub fn validate_coverage(&self, results: &[SearchResultWithEngine]) -> Result<()> {
        let general = results
            .iter()
            .filter(|r| r.engine == EngineId::General)
            .count();
        if general == 0 || results.len() < self.config.min_total_results {
            return Err(ResearchError::InsufficientCoverage {
                total: results.len(),
                general,
                minimum: self.config.min_total_results,
            });
        }
        Ok(())
    }

    async fn execute_query(&self, query: &ResearchQuery) -> QueryOutcome {
        let engine = query.engine;
        let tag = |results: Vec<SearchResult>, reasoning: String| {
            results
                .into_iter()
                .map(|r| SearchResultWithEngine::new(r, engine, reasoning.clone()))
                .collect::<Vec<_>>()
        };

        let error = match self.run_engine(engine, &query.query).await {
            Ok(results) => {
                return QueryOutcome {
                    engine,
                    results: Some(tag(results, query.reasoning.clone())),
                }
            }
            Err(e) => e,
        };

        if !engine.is_critical() {
            debug!(%engine, query = %query.query, error = %error, "Dropping specialized query");
            return QueryOutcome {
                engine,
                results: None,
            };
        }

        let broadened = broaden_query(&query.query);
        warn!(
            query = %query.query,
            fallback = %broadened,
            error = %error,
            "General query failed, trying broadened fallback"
        );
        match self.run_engine(engine, &broadened).await {
            Ok(results) => QueryOutcome {
                engine,
                results: Some(tag(results, format!("{} (broadened fallback)", query.reasoning))),
            },
            Err(e) => {
                warn!(query = %query.query, error = %e, "Fallback failed, dropping general query");
                QueryOutcome {
                    engine,
                    results: None,
                }
            }
        }
    }

    /// One breaker-gated, retried call against `engine`.
    async fn run_engine(&self, engine: EngineId, text: &str) -> Result<Vec<SearchResult>, EngineError> {
        let Some(client) = self.engines.get(engine) else {
            return Err(EngineError::NotConfigured(engine));
        };
        // Held across the await so a call cut off by the run deadline still
        // settles a half-open trial.
        let Some(admission) = self.breakers.admit(engine.as_str()) else {
            return Err(EngineError::CircuitOpen(engine));
        };

        let started = Instant::now();
        let timeout = millis(self.config.query_timeout_ms);
        let outcome = self
            .retry
            .retry(|| {
                let client = client.clone();
                async move {
                    tokio::time::timeout(timeout, client.search(text))
                        .await
                        .unwrap_or_else(|_| Err(EngineError::Timeout(timeout.as_millis() as u64)))
                }
            })
            .await;

        let agent = engine.agent_name();
        match &outcome {
            Ok(results) => {
                admission.success();
                if let Some(comms) = &self.comms {
                    comms.record_agent_execution(&agent, true, started.elapsed(), results.len(), None);
                }
            }
            Err(e) => {
                admission.failure();
                if let Some(comms) = &self.comms {
                    comms.record_agent_execution(&agent, false, started.elapsed(), 0, Some(e.to_string().as_str()));
                }
            }
        }
        outcome
    }

    fn report_run(&self, success: bool, started: Instant, results: usize) {
        if let Some(comms) = &self.comms {
            comms.send_message(
                if success {
                    MessageType::TaskResult
                } else {
                    MessageType::ErrorReport
                },
                serde_json::json!({
                    "stage": "execution",
                    "success": success,
                    "results": results,
                    "elapsedMs": started.elapsed().as_millis() as u64,
                    "breakers": self.breakers.status(),
                }),
                None,
                None,
            );
        }
    }
}
