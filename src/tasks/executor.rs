use async_trait::async_trait;
use graph_flow::{Context, GraphError, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{fail_stage, load_research_context, record_task_time, RESEARCH_CONTEXT};
use crate::research::ResearchExecutionModule;

pub struct ExecutorTask {
    executor: Arc<ResearchExecutionModule>,
}

impl ExecutorTask {
    pub const ID: &'static str = "executor";

    pub fn new(executor: Arc<ResearchExecutionModule>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Task for ExecutorTask {
    fn id(&self) -> &str {
        Self::ID
    }

    #[instrument(skip(self, context))]
    async fn run(&self, context: Context) -> Result<TaskResult, GraphError> {
        let start_time = std::time::Instant::now();
        info!("Starting execution task");

        let mut research_context = load_research_context(&context).await?;
        let plan = research_context
            .plan
            .as_ref()
            .ok_or_else(|| GraphError::ContextError("Research plan not found".to_string()))?;

        let results = match self.executor.execute_plan(plan).await {
            Ok(results) => results,
            Err(e) => return Err(fail_stage(&context, e).await),
        };

        info!("Collected {} unique results", results.len());
        research_context.results = results;
        context.set(RESEARCH_CONTEXT, research_context).await;
        record_task_time(&context, Self::ID, start_time).await;

        Ok(TaskResult::new(
            Some("Research plan executed".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}
