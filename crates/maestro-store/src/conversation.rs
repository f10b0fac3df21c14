use crate::keys::agent_session;
use crate::store::{get_json, put_json, StateStore};
use chrono::{DateTime, Utc};
use maestro_core::{retry_with_backoff, MaestroResult, RetryPolicy, ToolInvocation, Turn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-agent, per-session memory: turns, tool calls and the dedup table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConversationState {
    /// Owning agent.
    pub agent: String,
    /// The workflow instance id.
    pub session_id: String,
    /// Conversation so far, oldest first.
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Tool calls made by the task loop.
    #[serde(default)]
    pub tool_history: Vec<ToolInvocation>,
    /// Trigger dedup key to the time it was first processed.
    #[serde(default)]
    pub processed: BTreeMap<String, DateTime<Utc>>,
}

impl AgentConversationState {
    pub fn new(agent: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn record_tool(&mut self, invocation: ToolInvocation) {
        self.tool_history.push(invocation);
    }

    pub fn has_processed(&self, dedup_key: &str) -> bool {
        self.processed.contains_key(dedup_key)
    }

    pub fn mark_processed(&mut self, dedup_key: impl Into<String>, at: DateTime<Utc>) {
        self.processed.entry(dedup_key.into()).or_insert(at);
    }

    /// Drop dedup entries older than `ttl`. Returns how many were removed.
    pub fn prune_processed(&mut self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let before = self.processed.len();
        self.processed.retain(|_, seen| {
            now.signed_duration_since(*seen)
                .to_std()
                .map(|age| age <= ttl)
                .unwrap_or(true)
        });
        before - self.processed.len()
    }
}

/// Loads and saves [`AgentConversationState`] under
/// `agents/{agentName}/session/{sessionId}`.
///
/// Each agent runtime is the single writer of its own sessions, so saves are
/// unconditional.
#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn load(
        &self,
        agent: &str,
        session_id: &str,
    ) -> MaestroResult<AgentConversationState> {
        let key = agent_session(agent, session_id);
        let loaded = retry_with_backoff(&self.retry, "conversation.load", || {
            get_json::<AgentConversationState>(self.store.as_ref(), &key)
        })
        .await?;
        Ok(loaded
            .map(|(state, _)| state)
            .unwrap_or_else(|| AgentConversationState::new(agent, session_id)))
    }

    pub async fn save(&self, state: &AgentConversationState) -> MaestroResult<()> {
        let key = agent_session(&state.agent, &state.session_id);
        retry_with_backoff(&self.retry, "conversation.save", || {
            put_json(self.store.as_ref(), &key, state, None)
        })
        .await?;
        Ok(())
    }

    /// Session ids stored for `agent`.
    pub async fn sessions(&self, agent: &str) -> MaestroResult<Vec<String>> {
        let prefix = agent_session(agent, "");
        Ok(self
            .store
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}
