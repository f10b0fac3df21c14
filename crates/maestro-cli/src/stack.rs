//! Wires configured components into one in-process deployment.

use crate::config::{ExecutorKind, MaestroConfig, StoreKind};
use maestro_agent::{
    AgentConfig, AgentHandle, AgentMonitor, AgentRuntime, EchoExecutor, HttpTaskExecutor,
    TaskExecutor,
};
use maestro_bus::{InMemoryBus, MessageBus};
use maestro_core::MaestroResult;
use maestro_gateway::AppState;
use maestro_orchestrator::{spawn_response_router, Orchestrator};
use maestro_store::{
    AgentRegistry, ConversationStore, FileStateStore, MemoryStateStore, StateStore,
};
use maestro_workflow::WorkflowEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Open the configured state store.
pub async fn open_store(config: &MaestroConfig) -> MaestroResult<Arc<dyn StateStore>> {
    Ok(match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStateStore::new()),
        StoreKind::File => Arc::new(FileStateStore::new(&config.store.data_dir).await?),
    })
}

/// A running engine with its orchestrator, agents and response router.
pub struct Stack {
    pub engine: Arc<WorkflowEngine>,
    pub registry: AgentRegistry,
    pub monitor: Arc<AgentMonitor>,
    workflow: String,
    config: MaestroConfig,
    agents: Vec<AgentHandle>,
    router: JoinHandle<()>,
}

impl Stack {
    /// Start everything and resume instances left RUNNING in the store.
    pub async fn start(config: MaestroConfig) -> MaestroResult<Self> {
        let store = open_store(&config).await?;
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let retry = config.retry().clone();
        let registry = AgentRegistry::new(store.clone(), retry.clone());
        let monitor = Arc::new(AgentMonitor::new());

        let mut agents = Vec::with_capacity(config.agent.len());
        for entry in &config.agent {
            let executor: Arc<dyn TaskExecutor> = match (entry.executor, &entry.url) {
                (ExecutorKind::Http, Some(url)) => Arc::new(HttpTaskExecutor::new(
                    url,
                    config.agents.max_loop_iterations,
                )),
                _ => Arc::new(EchoExecutor),
            };
            let mut agent_config = AgentConfig::new(&entry.name, &entry.role)
                .with_capabilities(entry.capabilities.clone());
            agent_config.dedup_ttl = Duration::from_secs(config.agents.dedup_ttl_secs);
            agent_config.heartbeat = Duration::from_secs(config.agents.heartbeat_secs);
            agent_config.retry = retry.clone();

            let handle = AgentRuntime::new(
                agent_config,
                bus.clone(),
                registry.clone(),
                ConversationStore::new(store.clone(), retry.clone()),
                executor,
                monitor.clone(),
            )
            .start()
            .await?;
            agents.push(handle);
        }

        let mut orchestrator = Orchestrator::new(
            config.orchestrator_config(),
            bus.clone(),
            registry.clone(),
            config.build_strategy()?,
            config.build_evaluator()?,
        );
        if let Some(summarizer) = config.build_summarizer()? {
            orchestrator = orchestrator.with_summarizer(summarizer);
        }
        orchestrator.register().await?;
        let workflow = config.orchestrator.name.clone();

        let engine = WorkflowEngine::new(store, config.engine.clone());
        engine.register(Arc::new(orchestrator)).await;
        let router = spawn_response_router(bus, engine.clone(), &workflow).await?;

        let resumed = engine.recover().await?;
        info!(
            agents = agents.len(),
            resumed = resumed.len(),
            workflow = %workflow,
            strategy = ?config.orchestrator.strategy,
            "Maestro stack started"
        );

        Ok(Self {
            engine,
            registry,
            monitor,
            workflow,
            config,
            agents,
            router,
        })
    }

    /// Name of the orchestrator workflow.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            workflow: self.workflow.clone(),
            retry: self.config.retry().clone(),
        })
    }

    /// Stop agents and abort in-flight instances; their state stays in the
    /// store for the next `recover`.
    pub async fn shutdown(self) {
        self.engine.shutdown().await;
        self.router.abort();
        for agent in self.agents {
            agent.stop().await;
        }
        info!("Maestro stack stopped");
    }
}
