//! Multi-engine topic research: plan queries across search engines, run them
//! with retries and circuit breakers, synthesize the results and extract a
//! subtopic tree.

pub mod agents;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod research;
pub mod resilience;
pub mod tasks;
pub mod tools;

pub use config::ResearchConfig;
pub use error::{EngineError, GenerationError, ResearchError, Result};
pub use pipeline::ResearchPipeline;
