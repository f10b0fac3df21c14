use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an agent runtime is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Processing,
    /// The last trigger ended with an executor error.
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Triggers run to completion, successful or not.
    pub triggers_processed: u64,
    /// Triggers whose task loop failed.
    pub errors: u64,
    /// Triggers dropped by the dedup table.
    pub duplicates_dropped: u64,
    /// Foreign broadcasts stored in history.
    pub broadcasts_received: u64,
    /// Total time spent executing triggers.
    pub busy_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent name.
    pub name: String,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Dedup key of the trigger being processed.
    pub current_trigger: Option<String>,
    /// Counters since start.
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: AgentStatus::Idle,
            current_trigger: None,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks status and counters for every agent runtime in the process.
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<String, AgentState>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start tracking `name` as idle.
    pub async fn track(&self, name: &str) {
        self.states
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| AgentState::new(name));
    }

    /// Mark an agent as processing a trigger.
    pub async fn start_trigger(&self, name: &str, dedup_key: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| AgentState::new(name));
        state.status = AgentStatus::Processing;
        state.current_trigger = Some(dedup_key.to_string());
    }

    /// Mark an agent idle again and account the time spent.
    pub async fn finish_trigger(&self, name: &str, busy_ms: u64, failed: bool) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.current_trigger = None;
            state.metrics.triggers_processed += 1;
            state.metrics.busy_ms += busy_ms;
            if failed {
                state.metrics.errors += 1;
                state.status = AgentStatus::Error;
            } else {
                state.status = AgentStatus::Idle;
            }
        }
    }

    pub async fn record_duplicate(&self, name: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.metrics.duplicates_dropped += 1;
        }
    }

    pub async fn record_broadcast(&self, name: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.metrics.broadcasts_received += 1;
        }
    }

    /// Snapshot of all agents, ordered by name.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        let mut out: Vec<AgentState> = states.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get_state(&self, name: &str) -> Option<AgentState> {
        self.states.read().await.get(name).cloned()
    }

    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.triggers_processed += state.metrics.triggers_processed;
            total.errors += state.metrics.errors;
            total.duplicates_dropped += state.metrics.duplicates_dropped;
            total.broadcasts_received += state.metrics.broadcasts_received;
            total.busy_ms += state.metrics.busy_ms;
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.snapshot().await,
            "aggregate": self.aggregate_metrics().await,
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
