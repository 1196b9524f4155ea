//! The research workflow as a graph-flow graph: planner, executor,
//! synthesizer, then extractor, each reading and writing one shared
//! [`ResearchContext`] in the session.

use graph_flow::{Context, FlowRunner, GraphBuilder, GraphError, Session, SessionStorage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::agents::{AgentCommunicationManager, MessageType, PLANNER_AGENT};
use crate::clock::{Clock, SystemClock};
use crate::config::{millis, ResearchConfig};
use crate::error::{ResearchError, Result};
use crate::models::{ResearchContext, ResearchReport, TopicUnderstanding, UserContext};
use crate::research::{
    ResearchExecutionModule, ResearchPlanningModule, SubtopicExtractor, SynthesisModule,
};
use crate::resilience::{CircuitBreakerManager, RetryPolicy};
use crate::tasks::{
    ExecutorTask, ExtractorTask, PlannerTask, SynthesizerTask, RESEARCH_CONTEXT, STAGE_ERROR,
    TASK_TIMES,
};
use crate::tools::{EngineSet, RigGenerator, TavilySearch, TextGenerator, UnavailableGenerator};

pub struct ResearchPipeline {
    runner: FlowRunner,
    storage: Arc<dyn SessionStorage>,
    comms: Arc<AgentCommunicationManager>,
    breakers: Arc<CircuitBreakerManager>,
}

impl ResearchPipeline {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        engines: EngineSet,
        config: &ResearchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let comms = Arc::new(AgentCommunicationManager::new(
            config.communication.clone(),
            clock.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerManager::new(&config.breaker, clock));

        let planner = ResearchPlanningModule::new(generator.clone(), config.planning.clone())
            .with_communication(comms.clone());
        let executor = ResearchExecutionModule::new(
            engines,
            breakers.clone(),
            RetryPolicy::from(&config.retry),
            config.execution.clone(),
        )
        .with_communication(comms.clone());
        let synthesis = SynthesisModule::new(generator.clone(), config.synthesis.clone())
            .with_communication(comms.clone());
        let extractor = SubtopicExtractor::new(generator, config.extraction.clone())
            .with_communication(comms.clone());

        let graph = GraphBuilder::new("research_pipeline")
            .add_task(Arc::new(PlannerTask::new(Arc::new(planner))))
            .add_task(Arc::new(ExecutorTask::new(Arc::new(executor))))
            .add_task(Arc::new(SynthesizerTask::new(Arc::new(synthesis))))
            .add_task(Arc::new(ExtractorTask::new(Arc::new(extractor))))
            .add_edge(PlannerTask::ID, ExecutorTask::ID)
            .add_edge(ExecutorTask::ID, SynthesizerTask::ID)
            .add_edge(SynthesizerTask::ID, ExtractorTask::ID)
            .build();

        let storage: Arc<dyn SessionStorage> = Arc::new(graph_flow::InMemorySessionStorage::new());
        let runner = FlowRunner::new(Arc::new(graph), storage.clone());

        Self {
            runner,
            storage,
            comms,
            breakers,
        }
    }

    /// Wires the OpenAI generator and Tavily engines from `config`. Missing
    /// keys leave the pipeline on its deterministic paths.
    pub fn from_config(config: &ResearchConfig) -> Self {
        let generator: Arc<dyn TextGenerator> = match RigGenerator::from_config(&config.providers) {
            Ok(generator) => Arc::new(generator),
            Err(e) => {
                warn!(error = %e, "Text generation disabled, using deterministic fallbacks");
                Arc::new(UnavailableGenerator)
            }
        };
        let engines = match TavilySearch::engine_set(
            &config.providers,
            millis(config.execution.query_timeout_ms),
        ) {
            Ok(engines) => engines,
            Err(e) => {
                warn!(error = %e, "Search engines not configured");
                EngineSet::new()
            }
        };
        Self::new(generator, engines, config, Arc::new(SystemClock))
    }

    pub fn communication(&self) -> &Arc<AgentCommunicationManager> {
        &self.comms
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Runs the whole workflow for `topic` in a fresh session.
    ///
    /// Without an explicit understanding one is inferred from the topic.
    #[instrument(skip(self, understanding, user_context))]
    pub async fn run(
        &self,
        topic: &str,
        understanding: Option<TopicUnderstanding>,
        user_context: Option<UserContext>,
    ) -> Result<ResearchReport> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ResearchError::InvalidInput("topic is empty".to_string()));
        }
        let start_time = Instant::now();
        let session_id = Uuid::new_v4().to_string();
        info!("Starting research workflow for session {}", session_id);

        let understanding = understanding.unwrap_or_else(|| TopicUnderstanding::infer(topic));
        let session = Session::new_from_task(session_id.clone(), PlannerTask::ID);
        session
            .context
            .set(
                RESEARCH_CONTEXT,
                ResearchContext::new(topic, understanding, user_context),
            )
            .await;
        let context = session.context.clone();
        self.storage
            .save(session)
            .await
            .map_err(|e| ResearchError::Pipeline(format!("failed to save session: {}", e)))?;

        self.comms.send_message(
            MessageType::TaskAssignment,
            serde_json::json!({ "stage": "planning", "topic": topic }),
            Some(PLANNER_AGENT),
            Some(session_id.as_str()),
        );

        if let Err(e) = self.drive(&session_id, &context).await {
            error!("Workflow error: {}", e);
            self.comms.send_message(
                MessageType::ErrorReport,
                serde_json::json!({ "topic": topic, "error": &e }),
                None,
                Some(session_id.as_str()),
            );
            return Err(e);
        }

        let session = self
            .storage
            .get(&session_id)
            .await
            .map_err(|e| ResearchError::Pipeline(format!("failed to load session: {}", e)))?
            .ok_or_else(|| ResearchError::Pipeline(format!("session {} not found", session_id)))?;
        let research_context: ResearchContext = session
            .context
            .get(RESEARCH_CONTEXT)
            .await
            .ok_or_else(|| ResearchError::Pipeline("research context missing".to_string()))?;
        let task_times: HashMap<String, u64> =
            session.context.get(TASK_TIMES).await.unwrap_or_default();

        let incomplete = |stage: &str| ResearchError::Pipeline(format!("{} output missing", stage));
        let report = ResearchReport {
            session_id: session_id.clone(),
            topic: research_context.topic,
            plan: research_context.plan.ok_or_else(|| incomplete("planning"))?,
            results: research_context.results,
            synthesis: research_context.synthesis.ok_or_else(|| incomplete("synthesis"))?,
            subtopics: research_context.subtopics.ok_or_else(|| incomplete("extraction"))?,
            system_health: self.comms.system_health(),
            total_time_ms: start_time.elapsed().as_millis() as u64,
            task_times,
        };

        info!("Workflow completed in {:?}", start_time.elapsed());
        self.comms.send_message(
            MessageType::Coordination,
            serde_json::json!({
                "event": "researchCompleted",
                "topic": report.topic,
                "results": report.results.len(),
                "subtopics": report.subtopics.flat.len(),
            }),
            None,
            Some(session_id.as_str()),
        );
        Ok(report)
    }

    async fn drive(&self, session_id: &str, context: &Context) -> Result<()> {
        loop {
            let result = match self.runner.run(session_id).await {
                Ok(result) => result,
                Err(e) => return Err(recover_stage_error(context, e).await),
            };

            match &result.status {
                graph_flow::ExecutionStatus::Completed => return Ok(()),
                graph_flow::ExecutionStatus::Paused { next_task_id, .. } => {
                    info!("Workflow paused, next task: {}", next_task_id);
                    continue;
                }
                graph_flow::ExecutionStatus::Error(message) => {
                    let fallback = ResearchError::Pipeline(message.to_string());
                    return Err(context.get(STAGE_ERROR).await.unwrap_or(fallback));
                }
                _ => {
                    return Err(ResearchError::Pipeline(
                        "workflow stopped waiting for input".to_string(),
                    ))
                }
            }
        }
    }
}

/// The typed error a task recorded, else whatever the runner carried.
async fn recover_stage_error(context: &Context, error: GraphError) -> ResearchError {
    if let Some(recorded) = context.get::<ResearchError>(STAGE_ERROR).await {
        return recorded;
    }
    match error {
        GraphError::Other(inner) => inner
            .downcast::<ResearchError>()
            .unwrap_or_else(|inner| ResearchError::Pipeline(inner.to_string())),
        other => ResearchError::Pipeline(other.to_string()),
    }
}
