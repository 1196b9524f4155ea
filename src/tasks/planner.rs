use async_trait::async_trait;
use graph_flow::{Context, GraphError, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{fail_stage, load_research_context, record_task_time, RESEARCH_CONTEXT};
use crate::research::ResearchPlanningModule;

pub struct PlannerTask {
    planner: Arc<ResearchPlanningModule>,
}

impl PlannerTask {
    pub const ID: &'static str = "planner";

    pub fn new(planner: Arc<ResearchPlanningModule>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl Task for PlannerTask {
    fn id(&self) -> &str {
        Self::ID
    }

    #[instrument(skip(self, context))]
    async fn run(&self, context: Context) -> Result<TaskResult, GraphError> {
        let start_time = std::time::Instant::now();
        info!("Starting planning task");

        let mut research_context = load_research_context(&context).await?;
        let plan = match self
            .planner
            .plan_research(
                &research_context.topic,
                &research_context.understanding,
                research_context.user_context.as_ref(),
            )
            .await
        {
            Ok(plan) => plan,
            Err(e) => return Err(fail_stage(&context, e).await),
        };

        info!(
            "Planned {} queries: {:?}",
            plan.research_queries.len(),
            plan.engine_distribution
        );
        research_context.plan = Some(plan);
        context.set(RESEARCH_CONTEXT, research_context).await;
        record_task_time(&context, Self::ID, start_time).await;

        Ok(TaskResult::new(
            Some("Research plan created".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}
