use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health::{
    AgentHealthStatus, AgentHealthUpdate, AgentStatus, RecentError, SystemHealth,
};
use crate::clock::{elapsed_between, Clock, SystemClock};
use crate::config::{millis, CommunicationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    StatusUpdate,
    HealthCheck,
    ErrorReport,
    Coordination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub agent_name: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> anyhow::Result<()>;
}

/// Message bus and health registry shared by the research agents.
///
/// Each message type has its own broadcast channel; every registered handler
/// drains a private receiver in its own task, so a failing or slow handler
/// never holds up a sender or another handler.
pub struct AgentCommunicationManager {
    config: CommunicationConfig,
    clock: Arc<dyn Clock>,
    session_id: String,
    history: Mutex<VecDeque<AgentMessage>>,
    channels: DashMap<MessageType, broadcast::Sender<AgentMessage>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    health: DashMap<String, AgentHealthStatus>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl Default for AgentCommunicationManager {
    fn default() -> Self {
        Self::new(CommunicationConfig::default(), Arc::new(SystemClock))
    }
}

impl AgentCommunicationManager {
    pub fn new(config: CommunicationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            session_id: Uuid::new_v4().to_string(),
            history: Mutex::new(VecDeque::new()),
            channels: DashMap::new(),
            workers: Mutex::new(vec![]),
            health: DashMap::new(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn sender(&self, message_type: MessageType) -> broadcast::Sender<AgentMessage> {
        self.channels
            .entry(message_type)
            .or_insert_with(|| broadcast::channel(self.config.channel_capacity.max(1)).0)
            .clone()
    }

    pub fn subscribe(&self, message_type: MessageType) -> broadcast::Receiver<AgentMessage> {
        self.sender(message_type).subscribe()
    }

    /// Runs `handler` for every future message of `message_type`.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!(?message_type, "Ignoring handler registration after shutdown");
            return;
        }
        let mut rx = self.subscribe(message_type);
        let cancel = self.cancel.child_token();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(message) => {
                            if let Err(e) = handler.handle(&message).await {
                                warn!(message_id = %message.id, ?message_type, "Message handler failed: {:#}", e);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(?message_type, skipped, "Message handler lagging, messages dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
    }

    pub fn send_message(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
        target_agent: Option<&str>,
        session_id: Option<&str>,
    ) -> AgentMessage {
        let message = AgentMessage {
            id: Uuid::new_v4().to_string(),
            message_type,
            agent_name: target_agent.unwrap_or("system").to_string(),
            session_id: session_id.unwrap_or(&self.session_id).to_string(),
            timestamp: self.clock.now(),
            payload,
        };

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(message.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }

        if !self.shut_down.load(Ordering::SeqCst) {
            if let Some(sender) = self.channels.get(&message_type) {
                // No receivers is fine: nobody is listening for this type.
                let _ = sender.send(message.clone());
            }
        }
        debug!(message_id = %message.id, ?message_type, agent = %message.agent_name, "Message sent");
        message
    }

    pub fn message_history(&self, session_id: Option<&str>) -> Vec<AgentMessage> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .filter(|m| session_id.map_or(true, |s| m.session_id == s))
            .cloned()
            .collect()
    }

    pub fn update_agent_health(&self, agent_name: &str, update: AgentHealthUpdate) {
        let now = self.clock.now();
        let mut entry = self
            .health
            .entry(agent_name.to_string())
            .or_insert_with(|| AgentHealthStatus::new(agent_name, now));
        let agent = entry.value_mut();
        if let Some(metrics) = update.metrics {
            agent.metrics = metrics;
            agent.reclassify(self.config.degraded_latency_ms as f64);
        }
        if let Some(status) = update.status {
            agent.status = status;
        }
        if let Some(capabilities) = update.capabilities {
            agent.capabilities = capabilities;
        }
        if let Some(resource_usage) = update.resource_usage {
            agent.resource_usage = resource_usage;
        }
        agent.last_heartbeat = now;
    }

    pub fn record_agent_execution(
        &self,
        agent_name: &str,
        success: bool,
        response_time: Duration,
        result_count: usize,
        error: Option<&str>,
    ) {
        let now = self.clock.now();
        let mut entry = self
            .health
            .entry(agent_name.to_string())
            .or_insert_with(|| AgentHealthStatus::new(agent_name, now));
        let agent = entry.value_mut();
        agent.record_sample(success, response_time.as_secs_f64() * 1_000.0, result_count);
        if let Some(message) = error {
            agent.push_error(
                RecentError {
                    timestamp: now,
                    message: message.to_string(),
                },
                self.config.max_recent_errors,
            );
        }
        agent.last_heartbeat = now;
        agent.reclassify(self.config.degraded_latency_ms as f64);
    }

    pub fn agent_health(&self, agent_name: &str) -> Option<AgentHealthStatus> {
        self.health.get(agent_name).map(|a| a.clone())
    }

    pub fn system_health(&self) -> SystemHealth {
        let agents: Vec<AgentHealthStatus> = self.health.iter().map(|a| a.value().clone()).collect();
        SystemHealth::aggregate(&agents)
    }

    /// Marks agents whose last heartbeat is older than the timeout offline.
    ///
    /// Returns the names of agents that went offline in this sweep.
    pub fn sweep_heartbeats(&self) -> Vec<String> {
        let now = self.clock.now();
        let timeout = millis(self.config.heartbeat_timeout_ms);
        let mut went_offline = vec![];
        for mut agent in self.health.iter_mut() {
            if agent.status != AgentStatus::Offline
                && elapsed_between(agent.last_heartbeat, now) > timeout
            {
                agent.status = AgentStatus::Offline;
                went_offline.push(agent.key().clone());
            }
        }
        went_offline.sort();
        went_offline
    }

    /// Starts the periodic heartbeat sweep. The task stops on shutdown or
    /// once the manager is dropped.
    pub fn start_heartbeat(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        let period = millis(self.config.heartbeat_interval_ms.max(1));
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let offline = manager.sweep_heartbeats();
                        if !offline.is_empty() {
                            warn!(agents = ?offline, "Agents missed heartbeat, marked offline");
                            manager.send_message(
                                MessageType::HealthCheck,
                                serde_json::json!({ "offline": offline }),
                                None,
                                None,
                            );
                        }
                    }
                }
            }
        });
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
    }

    /// Stops the heartbeat and releases all handlers. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            worker.abort();
        }
        self.channels.clear();
        info!("Agent communication manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for AgentCommunicationManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AgentCommunicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCommunicationManager")
            .field("session_id", &self.session_id)
            .field("agents", &self.health.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::mpsc;

    fn manager_with(config: CommunicationConfig) -> (Arc<AgentCommunicationManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (Arc::new(AgentCommunicationManager::new(config, clock.clone())), clock)
    }

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, message: &AgentMessage) -> anyhow::Result<()> {
            self.0.send(message.id.clone())?;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, _message: &AgentMessage) -> anyhow::Result<()> {
            anyhow::bail!("handler exploded")
        }
    }

    #[test]
    fn history_is_bounded() {
        let (manager, _) = manager_with(CommunicationConfig {
            max_history: 3,
            ..CommunicationConfig::default()
        });
        let ids: Vec<_> = (0..5)
            .map(|i| {
                manager
                    .send_message(MessageType::StatusUpdate, serde_json::json!({ "i": i }), None, None)
                    .id
            })
            .collect();

        let history = manager.message_history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[2].id, ids[4]);
    }

    #[test]
    fn history_filters_by_session() {
        let (manager, _) = manager_with(CommunicationConfig::default());
        manager.send_message(MessageType::TaskResult, serde_json::Value::Null, Some("a"), Some("s1"));
        manager.send_message(MessageType::TaskResult, serde_json::Value::Null, Some("b"), Some("s2"));
        let s1 = manager.message_history(Some("s1"));
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].agent_name, "a");
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let (manager, _) = manager_with(CommunicationConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register_handler(MessageType::TaskResult, Arc::new(Failing));
        manager.register_handler(MessageType::TaskResult, Arc::new(Forward(tx)));

        let first = manager.send_message(MessageType::TaskResult, serde_json::Value::Null, None, None);
        let second = manager.send_message(MessageType::TaskResult, serde_json::Value::Null, None, None);
        manager.send_message(MessageType::StatusUpdate, serde_json::Value::Null, None, None);

        let received = tokio::time::timeout(Duration::from_secs(1), async {
            vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
        })
        .await
        .unwrap();
        assert_eq!(received, vec![first.id, second.id]);
        assert!(rx.try_recv().is_err());
        manager.shutdown();
    }

    #[test]
    fn executions_update_rolling_health() {
        let (manager, _) = manager_with(CommunicationConfig {
            max_recent_errors: 2,
            ..CommunicationConfig::default()
        });
        manager.record_agent_execution("video-search-agent", true, Duration::from_millis(100), 4, None);
        for i in 0..3 {
            manager.record_agent_execution(
                "video-search-agent",
                false,
                Duration::from_millis(300),
                0,
                Some(format!("boom {i}").as_str()),
            );
        }

        let health = manager.agent_health("video-search-agent").unwrap();
        assert_eq!(health.metrics.success_rate, 0.25);
        assert_eq!(health.metrics.response_time_ms, 250.0);
        assert_eq!(health.status, AgentStatus::Unhealthy);
        assert_eq!(health.errors.len(), 2);
        assert_eq!(health.errors[1].message, "boom 2");
    }

    #[test]
    fn partial_update_merges() {
        let (manager, _) = manager_with(CommunicationConfig::default());
        manager.update_agent_health(
            "planner",
            AgentHealthUpdate {
                capabilities: Some(vec!["planning".into()]),
                ..AgentHealthUpdate::default()
            },
        );
        manager.update_agent_health(
            "planner",
            AgentHealthUpdate {
                status: Some(AgentStatus::Degraded),
                ..AgentHealthUpdate::default()
            },
        );
        let health = manager.agent_health("planner").unwrap();
        assert_eq!(health.capabilities, vec!["planning".to_string()]);
        assert_eq!(health.status, AgentStatus::Degraded);
        assert_eq!(manager.system_health().overall_status, AgentStatus::Degraded);
    }

    #[test]
    fn stale_agents_go_offline() {
        let (manager, clock) = manager_with(CommunicationConfig {
            heartbeat_timeout_ms: 1_000,
            ..CommunicationConfig::default()
        });
        manager.record_agent_execution("a", true, Duration::from_millis(5), 1, None);
        clock.advance(Duration::from_millis(500));
        manager.record_agent_execution("b", true, Duration::from_millis(5), 1, None);
        clock.advance(Duration::from_millis(700));

        assert_eq!(manager.sweep_heartbeats(), vec!["a".to_string()]);
        assert!(manager.sweep_heartbeats().is_empty());
        assert_eq!(manager.agent_health("a").unwrap().status, AgentStatus::Offline);
        assert_eq!(manager.agent_health("b").unwrap().status, AgentStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timer_marks_stale_agents_offline() {
        let (manager, clock) = manager_with(CommunicationConfig {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 1_000,
            ..CommunicationConfig::default()
        });
        let mut health_checks = manager.subscribe(MessageType::HealthCheck);
        manager.record_agent_execution("video-search-agent", true, Duration::from_millis(5), 1, None);
        manager.start_heartbeat();

        clock.advance(Duration::from_secs(2));
        let message = tokio::time::timeout(Duration::from_secs(1), health_checks.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.payload["offline"], serde_json::json!(["video-search-agent"]));
        assert_eq!(
            manager.agent_health("video-search-agent").unwrap().status,
            AgentStatus::Offline
        );
        assert_eq!(manager.system_health().offline_agents, 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (manager, _) = manager_with(CommunicationConfig {
            heartbeat_interval_ms: 10,
            ..CommunicationConfig::default()
        });
        manager.start_heartbeat();
        manager.register_handler(MessageType::Coordination, Arc::new(Failing));
        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shut_down());

        let mut rx = manager.subscribe(MessageType::Coordination);
        manager.send_message(MessageType::Coordination, serde_json::Value::Null, None, None);
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.message_history(None).len(), 1);
    }
}
