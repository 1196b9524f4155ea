use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of most recent executions the rolling metrics are computed over.
pub const ROLLING_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Results produced per execution.
    pub throughput: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub active_tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct ExecutionSample {
    success: bool,
    response_time_ms: f64,
    result_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealthStatus {
    pub agent_name: String,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub metrics: AgentMetrics,
    pub capabilities: Vec<String>,
    pub resource_usage: ResourceUsage,
    pub errors: VecDeque<RecentError>,
    #[serde(skip)]
    samples: VecDeque<ExecutionSample>,
}

impl AgentHealthStatus {
    pub fn new(agent_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Healthy,
            last_heartbeat: now,
            metrics: AgentMetrics {
                success_rate: 1.0,
                ..AgentMetrics::default()
            },
            capabilities: vec![],
            resource_usage: ResourceUsage::default(),
            errors: VecDeque::new(),
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record_sample(&mut self, success: bool, response_time_ms: f64, result_count: usize) {
        self.samples.push_back(ExecutionSample {
            success,
            response_time_ms,
            result_count,
        });
        while self.samples.len() > ROLLING_WINDOW {
            self.samples.pop_front();
        }

        let n = self.samples.len() as f64;
        let successes = self.samples.iter().filter(|s| s.success).count() as f64;
        self.metrics.success_rate = successes / n;
        self.metrics.error_rate = 1.0 - self.metrics.success_rate;
        self.metrics.response_time_ms =
            self.samples.iter().map(|s| s.response_time_ms).sum::<f64>() / n;
        self.metrics.throughput =
            self.samples.iter().map(|s| s.result_count as f64).sum::<f64>() / n;
    }

    pub(crate) fn push_error(&mut self, error: RecentError, cap: usize) {
        self.errors.push_back(error);
        while self.errors.len() > cap {
            self.errors.pop_front();
        }
    }

    pub(crate) fn reclassify(&mut self, degraded_latency_ms: f64) {
        self.status = classify(&self.metrics, degraded_latency_ms);
    }
}

pub(crate) fn classify(metrics: &AgentMetrics, degraded_latency_ms: f64) -> AgentStatus {
    if metrics.success_rate >= 0.8 && metrics.response_time_ms <= degraded_latency_ms {
        AgentStatus::Healthy
    } else if metrics.success_rate >= 0.5 {
        AgentStatus::Degraded
    } else {
        AgentStatus::Unhealthy
    }
}

/// Partial health merged into an agent's stored record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealthUpdate {
    pub status: Option<AgentStatus>,
    pub metrics: Option<AgentMetrics>,
    pub capabilities: Option<Vec<String>>,
    pub resource_usage: Option<ResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub overall_status: AgentStatus,
    pub agent_count: usize,
    pub healthy_agents: usize,
    pub degraded_agents: usize,
    pub unhealthy_agents: usize,
    pub offline_agents: usize,
    pub average_response_time_ms: f64,
    pub system_load: f64,
}

impl SystemHealth {
    pub fn aggregate<'a>(agents: impl IntoIterator<Item = &'a AgentHealthStatus>) -> Self {
        let mut health = SystemHealth {
            overall_status: AgentStatus::Healthy,
            agent_count: 0,
            healthy_agents: 0,
            degraded_agents: 0,
            unhealthy_agents: 0,
            offline_agents: 0,
            average_response_time_ms: 0.0,
            system_load: 0.0,
        };
        let mut total_latency = 0.0;
        let mut total_load = 0.0;

        for agent in agents {
            health.agent_count += 1;
            match agent.status {
                AgentStatus::Healthy => health.healthy_agents += 1,
                AgentStatus::Degraded => health.degraded_agents += 1,
                AgentStatus::Unhealthy => health.unhealthy_agents += 1,
                AgentStatus::Offline => health.offline_agents += 1,
            }
            total_latency += agent.metrics.response_time_ms;
            total_load += (agent.resource_usage.cpu_percent / 100.0).clamp(0.0, 1.0);
        }

        if health.agent_count == 0 {
            return health;
        }
        let count = health.agent_count as f64;
        health.average_response_time_ms = total_latency / count;
        health.system_load = total_load / count;

        let non_healthy = health.agent_count - health.healthy_agents;
        health.overall_status = if health.unhealthy_agents > 0 && non_healthy * 2 > health.agent_count {
            AgentStatus::Unhealthy
        } else if non_healthy > 0 {
            AgentStatus::Degraded
        } else {
            AgentStatus::Healthy
        };
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, status: AgentStatus) -> AgentHealthStatus {
        let mut a = AgentHealthStatus::new(name, Utc::now());
        a.status = status;
        a
    }

    #[test]
    fn rolling_window_forgets_old_failures() {
        let mut a = AgentHealthStatus::new("a", Utc::now());
        for _ in 0..ROLLING_WINDOW {
            a.record_sample(false, 10.0, 0);
        }
        assert_eq!(a.metrics.success_rate, 0.0);
        for _ in 0..ROLLING_WINDOW {
            a.record_sample(true, 20.0, 4);
        }
        assert_eq!(a.metrics.success_rate, 1.0);
        assert_eq!(a.metrics.response_time_ms, 20.0);
        assert_eq!(a.metrics.throughput, 4.0);
    }

    #[test]
    fn classification_thresholds() {
        let mut m = AgentMetrics {
            success_rate: 0.9,
            response_time_ms: 100.0,
            ..AgentMetrics::default()
        };
        assert_eq!(classify(&m, 1_000.0), AgentStatus::Healthy);
        m.response_time_ms = 5_000.0;
        assert_eq!(classify(&m, 1_000.0), AgentStatus::Degraded);
        m.success_rate = 0.2;
        assert_eq!(classify(&m, 1_000.0), AgentStatus::Unhealthy);
    }

    #[test]
    fn one_unhealthy_in_a_healthy_majority_is_degraded() {
        let agents = vec![
            agent("a", AgentStatus::Healthy),
            agent("b", AgentStatus::Healthy),
            agent("c", AgentStatus::Unhealthy),
        ];
        let health = SystemHealth::aggregate(&agents);
        assert_eq!(health.overall_status, AgentStatus::Degraded);
        assert_eq!(health.unhealthy_agents, 1);
    }

    #[test]
    fn unhealthy_majority_is_unhealthy() {
        let agents = vec![
            agent("a", AgentStatus::Healthy),
            agent("b", AgentStatus::Degraded),
            agent("c", AgentStatus::Unhealthy),
        ];
        assert_eq!(SystemHealth::aggregate(&agents).overall_status, AgentStatus::Unhealthy);
    }

    #[test]
    fn empty_system_is_healthy() {
        let health = SystemHealth::aggregate(std::iter::empty());
        assert_eq!(health.overall_status, AgentStatus::Healthy);
        assert_eq!(health.agent_count, 0);
    }
}
