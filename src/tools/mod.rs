pub mod engines;
pub mod llm;
pub mod tavily;

pub use engines::{EngineSet, SearchEngine};
pub use llm::{generate_structured, RigGenerator, TextGenerator, UnavailableGenerator};
pub use tavily::TavilySearch;
