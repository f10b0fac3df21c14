use crate::executor::{TaskExecutor, TaskInput};
use crate::monitor::AgentMonitor;
use chrono::Utc;
use maestro_bus::{topics, Envelope, MessageBus, Subscription};
use maestro_core::{
    retry_with_backoff, AgentTaskResponse, BroadcastMessage, BusMessage, MaestroResult,
    RetryPolicy, TaskStatus, TriggerAction, Turn, TurnRole,
};
use maestro_store::{AgentMetadata, AgentRegistry, ConversationStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identity and tuning of one agent runtime.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent identity; also names its inbox topic.
    pub name: String,
    /// Role advertised in the registry.
    pub role: String,
    /// Capabilities advertised in the registry.
    pub capabilities: Vec<String>,
    /// How long processed-trigger keys are remembered.
    pub dedup_ttl: Duration,
    /// Registry heartbeat period; zero disables heartbeats.
    pub heartbeat: Duration,
    /// Applies to store access and publishes.
    pub retry: RetryPolicy,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            capabilities: Vec::new(),
            dedup_ttl: Duration::from_secs(3600),
            heartbeat: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A single-consumer actor for one agent identity.
///
/// Directed triggers and broadcasts are consumed by one task, one message at
/// a time, so a runtime never works on two triggers concurrently. Different
/// runtimes run in parallel.
pub struct AgentRuntime {
    config: AgentConfig,
    bus: Arc<dyn MessageBus>,
    registry: AgentRegistry,
    conversations: ConversationStore,
    executor: Arc<dyn TaskExecutor>,
    monitor: Arc<AgentMonitor>,
}

/// Handle to a started runtime. Dropping it stops the actor.
pub struct AgentHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    actor: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop after the message currently being processed.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Some(hb) = &self.heartbeat {
            hb.abort();
        }
        let _ = self.actor.await;
        info!(agent = %self.name, "Agent runtime stopped");
    }

    /// Kill the runtime immediately, mid-message if need be.
    pub fn abort(&self) {
        self.actor.abort();
        if let Some(hb) = &self.heartbeat {
            hb.abort();
        }
    }
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        bus: Arc<dyn MessageBus>,
        registry: AgentRegistry,
        conversations: ConversationStore,
        executor: Arc<dyn TaskExecutor>,
        monitor: Arc<AgentMonitor>,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            conversations,
            executor,
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Register, subscribe and spawn the actor loop.
    ///
    /// Subscriptions are in place before this returns, so messages published
    /// afterwards are never missed.
    pub async fn start(self) -> MaestroResult<AgentHandle> {
        let name = self.config.name.clone();
        let inbox_topic = topics::agent_inbox(&name);

        self.registry
            .register(
                AgentMetadata::new(&name, &self.config.role, &inbox_topic)
                    .with_capabilities(self.config.capabilities.clone()),
            )
            .await?;
        let inbox = self.bus.subscribe(&inbox_topic).await?;
        let broadcast = self.bus.subscribe(topics::BROADCAST).await?;
        self.monitor.track(&name).await;

        let heartbeat = (!self.config.heartbeat.is_zero()).then(|| {
            let registry = self.registry.clone();
            let period = self.config.heartbeat;
            let name = name.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = registry.heartbeat(&name).await {
                        warn!(agent = %name, error = %e, "Heartbeat failed");
                    }
                }
            })
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let actor = tokio::spawn(self.run(inbox, broadcast, shutdown_rx));
        info!(agent = %name, topic = %inbox_topic, "Agent runtime started");

        Ok(AgentHandle {
            name,
            shutdown,
            actor,
            heartbeat,
        })
    }

    async fn run(
        self,
        mut inbox: Subscription,
        mut broadcast: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                env = inbox.recv() => match env {
                    Some(env) => self.on_direct(env).await,
                    None => break,
                },
                env = broadcast.recv() => match env {
                    Some(env) => self.on_broadcast(env).await,
                    None => break,
                },
            }
        }
        debug!(agent = %self.config.name, "Actor loop exited");
    }

    async fn on_direct(&self, env: Envelope) {
        match env.message {
            BusMessage::TriggerAction(trigger) if trigger.target_agent == self.config.name => {
                self.process_trigger(trigger).await;
            }
            other => {
                warn!(
                    agent = %self.config.name,
                    kind = other.kind(),
                    source = %env.source,
                    "Ignoring unexpected message on inbox"
                );
            }
        }
    }

    async fn process_trigger(&self, trigger: TriggerAction) {
        let name = &self.config.name;
        let key = trigger.dedup_key();

        let mut state = match self.conversations.load(name, &trigger.instance_id).await {
            Ok(state) => state,
            Err(e) => {
                error!(
                    agent = %name,
                    instance_id = %trigger.instance_id,
                    error = %e,
                    "Cannot load conversation state"
                );
                let response = AgentTaskResponse::for_trigger(
                    &trigger,
                    format!("{}: conversation state unavailable: {e}", e.code()),
                    TaskStatus::Error,
                );
                if let Err(e) = self.publish(&trigger.reply_topic, response.into()).await {
                    error!(agent = %name, topic = %trigger.reply_topic, error = %e, "Failed to publish response");
                }
                return;
            }
        };
        state.prune_processed(self.config.dedup_ttl, Utc::now());
        if state.has_processed(&key) {
            info!(agent = %name, dedup_key = %key, "Dropping duplicate trigger");
            self.monitor.record_duplicate(name).await;
            return;
        }

        self.monitor.start_trigger(name, &key).await;
        let started = Instant::now();
        info!(
            agent = %name,
            instance_id = %trigger.instance_id,
            step = trigger.step,
            attempt = trigger.attempt,
            "Processing trigger"
        );

        let input = TaskInput {
            agent: name.clone(),
            task: trigger.task.clone(),
            plan_context: trigger.plan_context.clone(),
            history: state.turns.clone(),
        };
        state.push_turn(Turn::new(TurnRole::User, trigger.task.clone()));

        let (result, status) = match self.executor.execute(&input).await {
            Ok(output) => {
                state.push_turn(Turn::new(TurnRole::Assistant, output.result.clone()).with_name(name.clone()));
                for call in output.tool_calls {
                    state.record_tool(call);
                }
                (output.result, TaskStatus::Ok)
            }
            Err(e) => {
                warn!(agent = %name, instance_id = %trigger.instance_id, error = %e, "Task loop failed");
                (format!("{}: {e}", e.code()), TaskStatus::Error)
            }
        };

        state.mark_processed(key, Utc::now());
        if let Err(e) = self.conversations.save(&state).await {
            error!(agent = %name, error = %e, "Failed to persist conversation state");
        }

        let response = AgentTaskResponse::for_trigger(&trigger, result.clone(), status);
        if let Err(e) = self.publish(&trigger.reply_topic, response.into()).await {
            error!(agent = %name, topic = %trigger.reply_topic, error = %e, "Failed to publish response");
        }

        let summary = BroadcastMessage {
            instance_id: trigger.instance_id.clone(),
            from_agent: name.clone(),
            summary: format!("{name} finished step {} ({status}): {result}", trigger.step),
        };
        if let Err(e) = self.publish(topics::BROADCAST, summary.into()).await {
            warn!(agent = %name, error = %e, "Failed to publish broadcast");
        }

        let busy_ms = started.elapsed().as_millis() as u64;
        self.monitor
            .finish_trigger(name, busy_ms, status == TaskStatus::Error)
            .await;
    }

    async fn on_broadcast(&self, env: Envelope) {
        let name = &self.config.name;
        let BusMessage::BroadcastMessage(msg) = env.message else {
            return;
        };
        if env.source == *name || msg.from_agent == *name {
            return;
        }

        self.monitor.record_broadcast(name).await;
        let appended = async {
            let mut state = self.conversations.load(name, &msg.instance_id).await?;
            state.push_turn(Turn::new(TurnRole::System, msg.summary.clone()).with_name(msg.from_agent.clone()));
            self.conversations.save(&state).await
        }
        .await;
        if let Err(e) = appended {
            warn!(agent = %name, from = %msg.from_agent, error = %e, "Failed to store broadcast");
        }
    }

    async fn publish(&self, topic: &str, message: BusMessage) -> MaestroResult<()> {
        retry_with_backoff(&self.config.retry, "agent.publish", || {
            self.bus.publish(topic, &self.config.name, message.clone())
        })
        .await?;
        Ok(())
    }
}
