use graph_flow::{Context, GraphError};
use std::collections::HashMap;
use std::time::Instant;

use crate::error::ResearchError;
use crate::models::ResearchContext;

mod executor;
mod extractor;
mod planner;
mod synthesizer;

pub use executor::ExecutorTask;
pub use extractor::ExtractorTask;
pub use planner::PlannerTask;
pub use synthesizer::SynthesizerTask;

pub const RESEARCH_CONTEXT: &str = "research_context";
pub const TASK_TIMES: &str = "task_times";
pub const STAGE_ERROR: &str = "stage_error";

async fn load_research_context(context: &Context) -> Result<ResearchContext, GraphError> {
    context
        .get(RESEARCH_CONTEXT)
        .await
        .ok_or_else(|| GraphError::ContextError("Research context not found".to_string()))
}

async fn record_task_time(context: &Context, task: &str, start_time: Instant) {
    let elapsed = start_time.elapsed().as_millis() as u64;
    let mut task_times: HashMap<String, u64> = context.get(TASK_TIMES).await.unwrap_or_default();
    task_times.insert(task.to_string(), elapsed);
    context.set(TASK_TIMES, task_times).await;
}

/// Records a stage failure in the session and wraps it for the graph, so the
/// pipeline can recover the typed error whichever way the runner reports it.
async fn fail_stage(context: &Context, error: ResearchError) -> GraphError {
    context.set(STAGE_ERROR, &error).await;
    GraphError::Other(anyhow::Error::from(error))
}
