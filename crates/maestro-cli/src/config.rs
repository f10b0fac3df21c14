//! `maestro.toml` configuration.
//!
//! Every section is optional and falls back to the defaults below, so an
//! empty file is a valid (if agent-less) configuration.

use maestro_core::{MaestroError, MaestroResult, RetryPolicy};
use maestro_orchestrator::{
    HttpReasoner, OrchestratorConfig, PlanDrivenStrategy, ProgressEvaluator, RandomStrategy,
    Reasoner, ReasonerEvaluator, RoundRobinStrategy, SelectionStrategy, StatusEvaluator,
};
use maestro_workflow::EngineConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaestroConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub reasoner: ReasonerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub agents: AgentDefaults,
    #[serde(default)]
    pub agent: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty disables API-key auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Random,
    PlanDriven,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_orchestrator_name")]
    pub name: String,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_max_dispatch_retries")]
    pub max_dispatch_retries: u32,
    #[serde(default = "default_max_step_errors")]
    pub max_step_errors: u32,
}

fn default_orchestrator_name() -> String {
    "maestro".to_string()
}

fn default_max_iterations() -> u32 {
    10
}

fn default_response_timeout_ms() -> u64 {
    60_000
}

fn default_max_dispatch_retries() -> u32 {
    3
}

fn default_max_step_errors() -> u32 {
    2
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            name: default_orchestrator_name(),
            strategy: StrategyKind::default(),
            max_iterations: default_max_iterations(),
            response_timeout_ms: default_response_timeout_ms(),
            max_dispatch_retries: default_max_dispatch_retries(),
            max_step_errors: default_max_step_errors(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReasonerConfig {
    /// Base URL of the reasoning service; required by `plan_driven`.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Agents silent for longer are not selectable; `0` disables the check.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
}

fn default_liveness_timeout_secs() -> u64 {
    300
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

/// Settings shared by every `[[agent]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Tool-call round trips allowed per task for `http` executors.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

fn default_dedup_ttl_secs() -> u64 {
    3600
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_max_loop_iterations() -> u32 {
    5
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: default_dedup_ttl_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    Echo,
    Http,
}

/// One in-process agent runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Endpoint for `http` executors.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_role() -> String {
    "general".to_string()
}

impl MaestroConfig {
    /// Parse and validate a TOML document.
    pub fn parse(raw: &str) -> MaestroResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| MaestroError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub async fn load(path: &Path) -> MaestroResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            MaestroError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn validate(&self) -> MaestroResult<()> {
        if self.orchestrator.name.trim().is_empty() {
            return Err(MaestroError::Config("orchestrator.name is empty".into()));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(MaestroError::Config(
                "orchestrator.max_iterations must be at least 1".into(),
            ));
        }
        if self.orchestrator.strategy == StrategyKind::PlanDriven
            && self.reasoner.base_url.is_none()
        {
            return Err(MaestroError::Config(
                "strategy 'plan_driven' requires [reasoner] base_url".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agent {
            if agent.name.trim().is_empty() {
                return Err(MaestroError::Config("agent name is empty".into()));
            }
            if agent.name == self.orchestrator.name {
                return Err(MaestroError::Config(format!(
                    "agent '{}' clashes with the orchestrator name",
                    agent.name
                )));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(MaestroError::Config(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            if agent.executor == ExecutorKind::Http && agent.url.is_none() {
                return Err(MaestroError::Config(format!(
                    "agent '{}' uses the http executor without a url",
                    agent.name
                )));
            }
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.liveness_timeout_secs)
    }

    /// Orchestrator settings; publishes retry with the engine policy.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            name: self.orchestrator.name.clone(),
            max_iterations: self.orchestrator.max_iterations,
            response_timeout: Duration::from_millis(self.orchestrator.response_timeout_ms),
            max_dispatch_retries: self.orchestrator.max_dispatch_retries,
            liveness_timeout: self.liveness_timeout(),
            retry: self.retry().clone(),
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.engine.retry
    }

    fn reasoner(&self) -> MaestroResult<Arc<dyn Reasoner>> {
        let url = self.reasoner.base_url.as_deref().ok_or_else(|| {
            MaestroError::Config("no [reasoner] base_url configured".into())
        })?;
        Ok(Arc::new(HttpReasoner::new(url)))
    }

    pub fn build_strategy(&self) -> MaestroResult<Arc<dyn SelectionStrategy>> {
        Ok(match self.orchestrator.strategy {
            StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy),
            StrategyKind::Random => Arc::new(RandomStrategy),
            StrategyKind::PlanDriven => Arc::new(PlanDrivenStrategy::new(self.reasoner()?)),
        })
    }

    /// The plan-driven configuration also delegates evaluation to the
    /// reasoning service.
    pub fn build_evaluator(&self) -> MaestroResult<Arc<dyn ProgressEvaluator>> {
        Ok(match self.orchestrator.strategy {
            StrategyKind::PlanDriven => Arc::new(ReasonerEvaluator::new(self.reasoner()?)),
            _ => Arc::new(StatusEvaluator::new(self.orchestrator.max_step_errors)),
        })
    }

    /// Run summaries come from the reasoning service in the plan-driven
    /// configuration only.
    pub fn build_summarizer(&self) -> MaestroResult<Option<Arc<dyn Reasoner>>> {
        match self.orchestrator.strategy {
            StrategyKind::PlanDriven => Ok(Some(self.reasoner()?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = MaestroConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.orchestrator.name, "maestro");
        assert_eq!(config.orchestrator.strategy, StrategyKind::RoundRobin);
        assert_eq!(config.registry.liveness_timeout_secs, 300);
        assert_eq!(config.agents.dedup_ttl_secs, 3600);
        assert_eq!(config.engine.max_concurrent_instances, 64);
        assert!(config.agent.is_empty());
    }

    #[test]
    fn test_full_document() {
        let raw = r#"
            [server]
            host = "127.0.0.1"
            port = 8080
            api_keys = ["k1"]

            [store]
            kind = "file"
            data_dir = "/tmp/maestro"

            [engine]
            max_concurrent_instances = 4
            [engine.retry]
            max_retries = 1
            backoff_base_ms = 10
            backoff_max_ms = 100

            [orchestrator]
            strategy = "random"
            max_iterations = 7
            response_timeout_ms = 1500

            [registry]
            liveness_timeout_secs = 0

            [[agent]]
            name = "MathAgent"
            role = "math"
            capabilities = ["arithmetic"]

            [[agent]]
            name = "Writer"
            executor = "http"
            url = "http://localhost:9000/task"
        "#;
        let config = MaestroConfig::parse(raw).unwrap();
        assert_eq!(config.server.api_keys, vec!["k1"]);
        assert_eq!(config.store.kind, StoreKind::File);
        assert_eq!(config.engine.retry.max_retries, 1);
        assert_eq!(config.agent.len(), 2);
        assert_eq!(config.agent[1].executor, ExecutorKind::Http);
        assert_eq!(config.agent[1].role, "general");

        let orch = config.orchestrator_config();
        assert_eq!(orch.max_iterations, 7);
        assert_eq!(orch.response_timeout, Duration::from_millis(1500));
        assert!(orch.liveness_timeout.is_zero());
        assert_eq!(orch.retry.backoff_base_ms, 10);
        assert_eq!(config.build_strategy().unwrap().name(), "random");
    }

    #[test]
    fn test_plan_driven_requires_reasoner() {
        let err = MaestroConfig::parse("[orchestrator]\nstrategy = \"plan_driven\"\n").unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));

        let config = MaestroConfig::parse(
            "[orchestrator]\nstrategy = \"plan_driven\"\n[reasoner]\nbase_url = \"http://r\"\n",
        )
        .unwrap();
        assert!(config.build_strategy().is_ok());
        assert!(config.build_evaluator().is_ok());
        assert!(config.build_summarizer().unwrap().is_some());

        let round_robin = MaestroConfig::parse("").unwrap();
        assert!(round_robin.build_summarizer().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_agents_rejected() {
        let raw = "[[agent]]\nname = \"A\"\n[[agent]]\nname = \"A\"\n";
        let err = MaestroConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate agent name 'A'"));
    }

    #[test]
    fn test_unknown_executor_and_missing_url() {
        let err = MaestroConfig::parse("[[agent]]\nname = \"A\"\nexecutor = \"shell\"\n")
            .unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));

        let err = MaestroConfig::parse("[[agent]]\nname = \"A\"\nexecutor = \"http\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("without a url"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = MaestroConfig::parse("[orchestrator]\nstrategy = \"vote\"\n").unwrap_err();
        assert_eq!(err.code(), "ConfigError");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maestro.toml");
        tokio::fs::write(&path, "[server]\nport = 4000\n").await.unwrap();
        let config = MaestroConfig::load(&path).await.unwrap();
        assert_eq!(config.server.port, 4000);

        let missing = MaestroConfig::load(&dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(MaestroError::Config(_))));
    }
}
