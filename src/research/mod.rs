pub mod execution;
pub mod extraction;
pub mod planning;
pub mod synthesis;
pub mod text;

pub use execution::{broaden_query, deduplicate, ResearchExecutionModule};
pub use extraction::SubtopicExtractor;
pub use planning::{check_diversity, enforce_minimums, validate_plan, ResearchPlanningModule};
pub use synthesis::{
    apply_practical_weighting, calculate_practical_comprehensiveness, calculate_practical_focus,
    calculate_source_quality, SynthesisModule,
};
