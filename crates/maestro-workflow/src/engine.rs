use crate::context::WorkflowContext;
use crate::instance::{ExternalEvent, InstanceStatus, WorkflowInstance};
use async_trait::async_trait;
use maestro_core::{retry_with_backoff, MaestroError, MaestroResult, RetryPolicy};
use maestro_store::{get_json, keys, put_json, update_json, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Durable workflow logic driven by the engine.
///
/// `run` must be deterministic with respect to the context: every side effect
/// goes through [`WorkflowContext::step`] and every external input through
/// [`WorkflowContext::wait_for_event`], so that replay after a crash
/// reproduces the same sequence of calls.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &mut WorkflowContext, input: String) -> MaestroResult<String>;
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,
    /// Applied to engine-internal persistence.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_concurrent_instances() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: default_max_concurrent_instances(),
            retry: RetryPolicy::default(),
        }
    }
}

struct InstanceHandle {
    events: mpsc::UnboundedSender<ExternalEvent>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Runs workflow instances as independent tasks over a shared [`StateStore`].
///
/// Instance records are the only source of truth: a fresh engine pointed at
/// the same store can [`recover`](Self::recover) every RUNNING instance by
/// replaying its checkpoint log.
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    workflows: RwLock<HashMap<String, Arc<dyn Workflow>>>,
    running: Arc<RwLock<HashMap<String, InstanceHandle>>>,
    permits: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn StateStore>, config: EngineConfig) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_instances.max(1)));
        Arc::new(Self {
            store,
            config,
            workflows: RwLock::new(HashMap::new()),
            running: Arc::new(RwLock::new(HashMap::new())),
            permits,
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn register(&self, workflow: Arc<dyn Workflow>) {
        let name = workflow.name().to_string();
        self.workflows.write().await.insert(name.clone(), workflow);
        info!(workflow = %name, "Workflow registered");
    }

    /// Create a RUNNING instance of `workflow` and schedule it.
    ///
    /// Fails with `InvalidInputError` for an empty (or whitespace-only) task.
    /// Store failures are returned as-is so the caller can back off.
    pub async fn start_instance(&self, workflow: &str, input: &str) -> MaestroResult<String> {
        if input.trim().is_empty() {
            return Err(MaestroError::InvalidInput("task must not be empty".into()));
        }
        let wf = self.workflow(workflow).await?;

        let instance = WorkflowInstance::new(workflow, input);
        put_json(
            self.store.as_ref(),
            &keys::workflow_state(&instance.instance_id),
            &instance,
            Some(0),
        )
        .await?;

        let id = instance.instance_id.clone();
        info!(instance_id = %id, workflow, "Workflow instance started");
        self.spawn(wf, instance).await;
        Ok(id)
    }

    /// Deliver an event to an instance. Buffered durably until awaited.
    ///
    /// Events for terminal instances are dropped.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> MaestroResult<()> {
        let event = ExternalEvent::new(event_type, payload);
        let key = keys::workflow_state(instance_id);
        let mut accepted = false;
        update_json::<WorkflowInstance, _>(self.store.as_ref(), &key, &self.config.retry, |inst| {
            let mut inst =
                inst.ok_or_else(|| MaestroError::NotFound(format!("instance '{instance_id}'")))?;
            accepted = !inst.status.is_terminal();
            if accepted {
                inst.inbox.push(event.clone());
            }
            Ok(inst)
        })
        .await?;

        if !accepted {
            debug!(instance_id, event_type, "Dropping event for terminal instance");
            return Ok(());
        }
        if let Some(handle) = self.running.read().await.get(instance_id) {
            let _ = handle.events.send(event);
        }
        debug!(instance_id, event_type, "Event raised");
        Ok(())
    }

    /// Request cancellation. Observed by the workflow at its next boundary.
    pub async fn cancel(&self, instance_id: &str) -> MaestroResult<()> {
        let key = keys::workflow_state(instance_id);
        update_json::<WorkflowInstance, _>(self.store.as_ref(), &key, &self.config.retry, |inst| {
            let mut inst =
                inst.ok_or_else(|| MaestroError::NotFound(format!("instance '{instance_id}'")))?;
            if !inst.status.is_terminal() {
                inst.cancel_requested = true;
            }
            Ok(inst)
        })
        .await?;
        if let Some(handle) = self.running.read().await.get(instance_id) {
            handle.cancel.store(true, Ordering::SeqCst);
        }
        info!(instance_id, "Cancellation requested");
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> MaestroResult<Option<WorkflowInstance>> {
        Ok(
            get_json::<WorkflowInstance>(self.store.as_ref(), &keys::workflow_state(instance_id))
                .await?
                .map(|(inst, _)| inst),
        )
    }

    /// Every instance in the store, oldest first.
    pub async fn list_instances(&self) -> MaestroResult<Vec<WorkflowInstance>> {
        let mut out = Vec::new();
        for key in self.store.keys(keys::WORKFLOW_PREFIX).await? {
            if keys::instance_id_from_key(&key).is_none() {
                continue;
            }
            if let Some((inst, _)) = get_json::<WorkflowInstance>(self.store.as_ref(), &key).await? {
                out.push(inst);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Poll until the instance is terminal or `timeout` elapses, then return
    /// its latest record.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> MaestroResult<WorkflowInstance> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inst = self
                .get_instance(instance_id)
                .await?
                .ok_or_else(|| MaestroError::NotFound(format!("instance '{instance_id}'")))?;
            if inst.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(inst);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Resume every RUNNING instance found in the store that this engine is
    /// not already executing. Returns the resumed instance ids.
    pub async fn recover(&self) -> MaestroResult<Vec<String>> {
        let mut resumed = Vec::new();
        for inst in self.list_instances().await? {
            if inst.status != InstanceStatus::Running {
                continue;
            }
            if self.running.read().await.contains_key(&inst.instance_id) {
                continue;
            }
            let wf = match self.workflow(&inst.workflow).await {
                Ok(wf) => wf,
                Err(e) => {
                    warn!(instance_id = %inst.instance_id, workflow = %inst.workflow, error = %e, "Cannot recover instance");
                    continue;
                }
            };
            info!(
                instance_id = %inst.instance_id,
                checkpoints = inst.checkpoints.len(),
                "Recovering workflow instance"
            );
            resumed.push(inst.instance_id.clone());
            self.spawn(wf, inst).await;
        }
        Ok(resumed)
    }

    /// Abort every in-flight instance task. State stays in the store.
    pub async fn shutdown(&self) {
        let mut running = self.running.write().await;
        for (id, handle) in running.drain() {
            handle.task.abort();
            debug!(instance_id = %id, "Instance task aborted");
        }
        info!("Workflow engine shut down");
    }

    /// Number of instances currently executing in this engine.
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    async fn workflow(&self, name: &str) -> MaestroResult<Arc<dyn Workflow>> {
        self.workflows
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("workflow '{name}'")))
    }

    async fn spawn(&self, workflow: Arc<dyn Workflow>, instance: WorkflowInstance) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(instance.cancel_requested));
        let instance_id = instance.instance_id.clone();

        let runner = InstanceRunner {
            store: self.store.clone(),
            retry: self.config.retry.clone(),
            running: self.running.clone(),
            permits: self.permits.clone(),
        };

        // Hold the write lock across spawn so the task cannot deregister
        // itself before its handle is inserted.
        let mut running = self.running.write().await;
        let task = tokio::spawn(runner.run(workflow, instance, rx, cancel.clone()));
        running.insert(
            instance_id,
            InstanceHandle {
                events: tx,
                cancel,
                task,
            },
        );
    }
}

struct InstanceRunner {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    running: Arc<RwLock<HashMap<String, InstanceHandle>>>,
    permits: Arc<Semaphore>,
}

impl InstanceRunner {
    async fn run(
        self,
        workflow: Arc<dyn Workflow>,
        instance: WorkflowInstance,
        events: mpsc::UnboundedReceiver<ExternalEvent>,
        cancel: Arc<AtomicBool>,
    ) {
        let id = instance.instance_id.clone();
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        // The caller's snapshot may predate events raised before our handle
        // was registered; those only exist in the stored inbox.
        let Some(instance) = self.refresh(instance).await else {
            self.running.write().await.remove(&id);
            return;
        };
        if instance.cancel_requested {
            cancel.store(true, Ordering::SeqCst);
        }

        let mut ctx = WorkflowContext::new(
            &instance,
            self.store.clone(),
            self.retry.clone(),
            events,
            cancel,
        );
        let outcome = workflow.run(&mut ctx, instance.input.clone()).await;

        match &outcome {
            Ok(_) => info!(instance_id = %id, "Workflow instance completed"),
            Err(e) => warn!(instance_id = %id, code = e.code(), error = %e, "Workflow instance failed"),
        }

        let key = keys::workflow_state(&id);
        let finalized = update_json::<WorkflowInstance, _>(self.store.as_ref(), &key, &self.retry, |inst| {
            let mut inst = inst.ok_or_else(|| MaestroError::NotFound(key.clone()))?;
            match &outcome {
                Ok(result) => inst.complete(result.clone()),
                Err(e) => inst.fail(e),
            }
            Ok(inst)
        })
        .await;
        if let Err(e) = finalized {
            // Left RUNNING in the store; a later recover() replays it.
            error!(instance_id = %id, error = %e, "Failed to persist terminal status");
        }

        self.running.write().await.remove(&id);
    }

    /// Latest stored record, or `None` if it is gone or already terminal.
    async fn refresh(&self, snapshot: WorkflowInstance) -> Option<WorkflowInstance> {
        let key = keys::workflow_state(&snapshot.instance_id);
        let stored = retry_with_backoff(&self.retry, "engine.refresh", || {
            get_json::<WorkflowInstance>(self.store.as_ref(), &key)
        })
        .await;
        match stored {
            Ok(Some((fresh, _))) if fresh.status.is_terminal() => {
                debug!(instance_id = %fresh.instance_id, "Instance already terminal, not running");
                None
            }
            Ok(Some((fresh, _))) => Some(fresh),
            Ok(None) => {
                warn!(instance_id = %snapshot.instance_id, "Instance record vanished before start");
                None
            }
            Err(e) => {
                warn!(instance_id = %snapshot.instance_id, error = %e, "Cannot refresh instance, using snapshot");
                Some(snapshot)
            }
        }
    }
}
