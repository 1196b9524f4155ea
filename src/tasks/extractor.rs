use async_trait::async_trait;
use graph_flow::{Context, GraphError, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{fail_stage, load_research_context, record_task_time, RESEARCH_CONTEXT};
use crate::research::SubtopicExtractor;

pub struct ExtractorTask {
    extractor: Arc<SubtopicExtractor>,
}

impl ExtractorTask {
    pub const ID: &'static str = "extractor";

    pub fn new(extractor: Arc<SubtopicExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Task for ExtractorTask {
    fn id(&self) -> &str {
        Self::ID
    }

    #[instrument(skip(self, context))]
    async fn run(&self, context: Context) -> Result<TaskResult, GraphError> {
        let start_time = std::time::Instant::now();
        info!("Starting subtopic extraction task");

        let mut research_context = load_research_context(&context).await?;
        let synthesis = research_context
            .synthesis
            .as_ref()
            .ok_or_else(|| GraphError::ContextError("Synthesis not found".to_string()))?;

        let subtopics = match self
            .extractor
            .extract(
                &research_context.topic,
                &research_context.results,
                synthesis,
                research_context.user_context.as_ref(),
            )
            .await
        {
            Ok(subtopics) => subtopics,
            Err(e) => return Err(fail_stage(&context, e).await),
        };

        info!("Extracted {} subtopics", subtopics.flat.len());
        research_context.subtopics = Some(subtopics);
        context.set(RESEARCH_CONTEXT, research_context).await;
        record_task_time(&context, Self::ID, start_time).await;

        Ok(TaskResult::new(
            Some("Subtopics extracted".to_string()),
            NextAction::End,
        ))
    }
}
