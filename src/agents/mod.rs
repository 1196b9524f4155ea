mod communication;
mod health;

pub use communication::{AgentCommunicationManager, AgentMessage, MessageHandler, MessageType};
pub use health::{
    AgentHealthStatus, AgentHealthUpdate, AgentMetrics, AgentStatus, RecentError, ResourceUsage,
    SystemHealth, ROLLING_WINDOW,
};

/// Agent name the planning stage reports under.
pub const PLANNER_AGENT: &str = "research-planner";
pub const SYNTHESIS_AGENT: &str = "synthesis-agent";
pub const EXTRACTION_AGENT: &str = "subtopic-extractor";
