use crate::keys::REGISTRY_AGENTS;
use crate::store::{get_json, update_json, StateStore};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Catalog entry for one agent (or orchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    /// Unique agent name; also the registry key.
    pub name: String,
    /// Free-form role shown to the selection strategy.
    pub role: String,
    /// Topic the agent consumes triggers from.
    pub inbound_topic: String,
    /// Skills advertised to the selection strategy.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Orchestrators are registered too but are never selected for tasks.
    #[serde(default)]
    pub orchestrator: bool,
    /// Bumped on every upsert.
    #[serde(default)]
    pub version: u64,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Last registration or heartbeat.
    pub last_seen: DateTime<Utc>,
}

impl AgentMetadata {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        inbound_topic: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            role: role.into(),
            inbound_topic: inbound_topic.into(),
            capabilities: Vec::new(),
            orchestrator: false,
            version: 0,
            registered_at: now,
            last_seen: now,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn as_orchestrator(mut self) -> Self {
        self.orchestrator = true;
        self
    }

    /// Whether this entry has been silent longer than `liveness`.
    /// A zero duration disables staleness.
    pub fn is_stale(&self, liveness: Duration, now: DateTime<Utc>) -> bool {
        if liveness.is_zero() {
            return false;
        }
        let age = now.signed_duration_since(self.last_seen);
        age.to_std().map(|a| a > liveness).unwrap_or(false)
    }
}

type RegistryMap = BTreeMap<String, AgentMetadata>;

/// Agent registry persisted as a single map under `registry/agents`.
///
/// Every write is a read-modify-write under the key's etag, so concurrent
/// registrations from different runtimes never drop each other's entries.
/// Listings come back ordered by name.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Insert or replace an entry. `registeredAt` survives re-registration.
    pub async fn register(&self, meta: AgentMetadata) -> MaestroResult<AgentMetadata> {
        if meta.name.trim().is_empty() {
            return Err(MaestroError::InvalidInput("Agent name is empty".into()));
        }
        let name = meta.name.clone();
        let mut stored = None;
        update_json::<RegistryMap, _>(self.store.as_ref(), REGISTRY_AGENTS, &self.retry, |map| {
            let mut map = map.unwrap_or_default();
            let mut entry = meta.clone();
            let now = Utc::now();
            match map.get(&name) {
                Some(prev) => {
                    entry.version = prev.version + 1;
                    entry.registered_at = prev.registered_at;
                }
                None => {
                    entry.version = 1;
                    entry.registered_at = now;
                }
            }
            entry.last_seen = now;
            stored = Some(entry.clone());
            map.insert(name.clone(), entry);
            Ok(map)
        })
        .await?;

        let entry = stored.ok_or_else(|| MaestroError::NotFound(name.clone()))?;
        info!(agent = %entry.name, role = %entry.role, version = entry.version, "Agent registered");
        Ok(entry)
    }

    /// Refresh `lastSeen` for `name`.
    pub async fn heartbeat(&self, name: &str) -> MaestroResult<()> {
        update_json::<RegistryMap, _>(self.store.as_ref(), REGISTRY_AGENTS, &self.retry, |map| {
            let mut map = map.unwrap_or_default();
            let entry = map
                .get_mut(name)
                .ok_or_else(|| MaestroError::NotFound(format!("agent '{name}'")))?;
            entry.last_seen = Utc::now();
            Ok(map)
        })
        .await?;
        debug!(agent = name, "Heartbeat");
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> MaestroResult<()> {
        update_json::<RegistryMap, _>(self.store.as_ref(), REGISTRY_AGENTS, &self.retry, |map| {
            let mut map = map.unwrap_or_default();
            map.remove(name);
            Ok(map)
        })
        .await?;
        info!(agent = name, "Agent deregistered");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> MaestroResult<Option<AgentMetadata>> {
        Ok(self.load().await?.remove(name))
    }

    /// Every entry, ordered by name.
    pub async fn list(&self) -> MaestroResult<Vec<AgentMetadata>> {
        Ok(self.load().await?.into_values().collect())
    }

    /// Agents eligible for task selection: not orchestrators and not stale.
    pub async fn list_selectable(&self, liveness: Duration) -> MaestroResult<Vec<AgentMetadata>> {
        let now = Utc::now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| !a.orchestrator && !a.is_stale(liveness, now))
            .collect())
    }

    async fn load(&self) -> MaestroResult<RegistryMap> {
        Ok(get_json::<RegistryMap>(self.store.as_ref(), REGISTRY_AGENTS)
            .await?
            .map(|(map, _)| map)
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStateStore;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(MemoryStateStore::new()), RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_register_bumps_version_and_keeps_registration_time() {
        let reg = registry();
        let first = reg
            .register(AgentMetadata::new("MathAgent", "math", "agents.MathAgent.inbox"))
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let second = reg
            .register(
                AgentMetadata::new("MathAgent", "math", "agents.MathAgent.inbox")
                    .with_capabilities(vec!["arithmetic".into()]),
            )
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.capabilities, vec!["arithmetic"]);
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_excludes_orchestrators() {
        let reg = registry();
        for name in ["Zed", "Alpha", "Mid"] {
            reg.register(AgentMetadata::new(name, "worker", format!("agents.{name}.inbox")))
                .await
                .unwrap();
        }
        reg.register(AgentMetadata::new("maestro", "orchestrator", "orchestrators.maestro.responses").as_orchestrator())
            .await
            .unwrap();

        let names: Vec<String> = reg.list().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["Alpha", "Mid", "Zed", "maestro"]);

        let selectable: Vec<String> = reg
            .list_selectable(Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(selectable, vec!["Alpha", "Mid", "Zed"]);
    }

    #[tokio::test]
    async fn test_stale_entries_are_not_selectable() {
        let reg = registry();
        let mut old = AgentMetadata::new("Old", "worker", "agents.Old.inbox");
        old.last_seen = Utc::now() - chrono::Duration::seconds(600);
        assert!(old.is_stale(Duration::from_secs(300), Utc::now()));
        assert!(!old.is_stale(Duration::ZERO, Utc::now()));

        reg.register(AgentMetadata::new("Fresh", "worker", "agents.Fresh.inbox"))
            .await
            .unwrap();
        let live = reg.list_selectable(Duration::from_secs(300)).await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_and_deregister() {
        let reg = registry();
        let err = reg.heartbeat("Nobody").await.unwrap_err();
        assert_eq!(err.code(), "NotFound");

        let meta = reg
            .register(AgentMetadata::new("MathAgent", "math", "agents.MathAgent.inbox"))
            .await
            .unwrap();
        reg.heartbeat("MathAgent").await.unwrap();
        let after = reg.get("MathAgent").await.unwrap().unwrap();
        assert!(after.last_seen >= meta.last_seen);

        reg.deregister("MathAgent").await.unwrap();
        assert!(reg.get("MathAgent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_empty_name() {
        let reg = registry();
        let err = reg
            .register(AgentMetadata::new("  ", "x", "agents.x.inbox"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidInputError");
    }
}
