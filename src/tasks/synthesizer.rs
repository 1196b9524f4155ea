use async_trait::async_trait;
use graph_flow::{Context, GraphError, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{load_research_context, record_task_time, RESEARCH_CONTEXT};
use crate::research::SynthesisModule;

pub struct SynthesizerTask {
    synthesis: Arc<SynthesisModule>,
}

impl SynthesizerTask {
    pub const ID: &'static str = "synthesizer";

    pub fn new(synthesis: Arc<SynthesisModule>) -> Self {
        Self { synthesis }
    }
}

#[async_trait]
impl Task for SynthesizerTask {
    fn id(&self) -> &str {
        Self::ID
    }

    #[instrument(skip(self, context))]
    async fn run(&self, context: Context) -> Result<TaskResult, GraphError> {
        let start_time = std::time::Instant::now();
        info!("Starting synthesis task");

        let mut research_context = load_research_context(&context).await?;
        let topic = research_context.topic.clone();
        let synthesis = self
            .synthesis
            .synthesize(&topic, &mut research_context.results)
            .await;

        info!("Synthesized {} insights", synthesis.key_insights.len());
        research_context.synthesis = Some(synthesis);
        context.set(RESEARCH_CONTEXT, research_context).await;
        record_task_time(&context, Self::ID, start_time).await;

        Ok(TaskResult::new(
            Some("Results synthesized".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}
