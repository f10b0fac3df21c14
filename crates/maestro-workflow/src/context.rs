use crate::instance::{Checkpoint, ExternalEvent, WorkflowInstance};
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult, RetryPolicy};
use maestro_store::{keys, update_json, StateStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Result of [`WorkflowContext::wait_for_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "payload", rename_all = "lowercase")]
pub enum EventOutcome {
    Received(serde_json::Value),
    Timeout,
}

/// Handle a running workflow uses to perform durable operations.
///
/// Every [`step`](Self::step) and [`wait_for_event`](Self::wait_for_event)
/// call is assigned the next sequence number. While the recorded log still
/// has entries at that position the call is answered from the log without
/// side effects; once the log is exhausted calls execute live and append.
pub struct WorkflowContext {
    instance_id: String,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    recorded: Vec<Checkpoint>,
    cursor: usize,
    pending: VecDeque<ExternalEvent>,
    known_events: HashSet<Uuid>,
    events: mpsc::UnboundedReceiver<ExternalEvent>,
    cancel: Arc<AtomicBool>,
}

impl WorkflowContext {
    pub(crate) fn new(
        instance: &WorkflowInstance,
        store: Arc<dyn StateStore>,
        retry: RetryPolicy,
        events: mpsc::UnboundedReceiver<ExternalEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let mut known_events: HashSet<Uuid> = instance
            .checkpoints
            .iter()
            .filter_map(|c| c.event_id)
            .collect();
        let mut pending = VecDeque::new();
        for ev in &instance.inbox {
            if known_events.insert(ev.id) {
                pending.push_back(ev.clone());
            }
        }
        Self {
            instance_id: instance.instance_id.clone(),
            store,
            retry,
            recorded: instance.checkpoints.clone(),
            cursor: 0,
            pending,
            known_events,
            events,
            cancel,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// True while calls are still being answered from the recorded log.
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.recorded.len()
    }

    /// Whether [`crate::WorkflowEngine::cancel`] was called for this instance.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run `f` at most once across crashes and return its result.
    ///
    /// A step that fails is not recorded; its error propagates to the caller.
    pub async fn step<T, F, Fut>(&mut self, name: &str, f: F) -> MaestroResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = MaestroResult<T>>,
    {
        if let Some(recorded) = self.replay_next(name)? {
            debug!(instance_id = %self.instance_id, step = name, seq = recorded.seq, "Replayed step");
            return Ok(serde_json::from_value(recorded.result)?);
        }
        let value = f().await?;
        self.record(name, serde_json::to_value(&value)?, None).await?;
        Ok(value)
    }

    /// Suspend until an event of `event_type` arrives or `timeout` elapses.
    ///
    /// Events of other types that arrive meanwhile stay buffered for later
    /// waits. The outcome, including a timeout, is checkpointed.
    pub async fn wait_for_event(
        &mut self,
        event_type: &str,
        timeout: Duration,
    ) -> MaestroResult<EventOutcome> {
        let name = format!("event:{event_type}");
        if let Some(recorded) = self.replay_next(&name)? {
            return Ok(serde_json::from_value(recorded.result)?);
        }

        let event = match self.take_pending(event_type) {
            Some(ev) => Some(ev),
            None => self.receive(event_type, timeout).await,
        };
        let outcome = match &event {
            Some(ev) => EventOutcome::Received(ev.payload.clone()),
            None => EventOutcome::Timeout,
        };
        self.record(&name, serde_json::to_value(&outcome)?, event.map(|e| e.id))
            .await?;
        Ok(outcome)
    }

    /// Persist workflow-defined state on the instance record.
    ///
    /// Skipped while replaying, where the stored value is already newer.
    pub async fn set_state<T: Serialize>(&mut self, state: &T) -> MaestroResult<()> {
        if self.is_replaying() {
            return Ok(());
        }
        let value = serde_json::to_value(state)?;
        let key = keys::workflow_state(&self.instance_id);
        update_json::<WorkflowInstance, _>(self.store.as_ref(), &key, &self.retry, |inst| {
            let mut inst = inst.ok_or_else(|| MaestroError::NotFound(key.clone()))?;
            inst.custom_state = value.clone();
            Ok(inst)
        })
        .await?;
        Ok(())
    }

    fn replay_next(&mut self, name: &str) -> MaestroResult<Option<Checkpoint>> {
        let Some(recorded) = self.recorded.get(self.cursor) else {
            return Ok(None);
        };
        if recorded.name != name {
            return Err(MaestroError::NonDeterminism {
                seq: self.cursor,
                expected: recorded.name.clone(),
                actual: name.to_string(),
            });
        }
        self.cursor += 1;
        Ok(Some(recorded.clone()))
    }

    async fn record(
        &mut self,
        name: &str,
        result: serde_json::Value,
        event_id: Option<Uuid>,
    ) -> MaestroResult<()> {
        let checkpoint = Checkpoint {
            seq: self.cursor,
            name: name.to_string(),
            result,
            event_id,
            recorded_at: Utc::now(),
        };
        let key = keys::workflow_state(&self.instance_id);
        update_json::<WorkflowInstance, _>(self.store.as_ref(), &key, &self.retry, |inst| {
            let mut inst = inst.ok_or_else(|| MaestroError::NotFound(key.clone()))?;
            match inst.checkpoints.get(checkpoint.seq) {
                None if inst.checkpoints.len() == checkpoint.seq => {
                    inst.checkpoints.push(checkpoint.clone());
                }
                Some(existing) if existing.name == checkpoint.name => {}
                other => {
                    return Err(MaestroError::NonDeterminism {
                        seq: checkpoint.seq,
                        expected: other.map_or_else(|| "<gap>".to_string(), |c| c.name.clone()),
                        actual: checkpoint.name.clone(),
                    });
                }
            }
            if let Some(id) = checkpoint.event_id {
                inst.inbox.retain(|e| e.id != id);
            }
            Ok(inst)
        })
        .await?;

        self.recorded.push(checkpoint);
        self.cursor += 1;
        Ok(())
    }

    fn take_pending(&mut self, event_type: &str) -> Option<ExternalEvent> {
        let idx = self.pending.iter().position(|e| e.event_type == event_type)?;
        self.pending.remove(idx)
    }

    async fn receive(&mut self, event_type: &str, timeout: Duration) -> Option<ExternalEvent> {
        // A timeout too large to represent means no deadline.
        let Some(deadline) = tokio::time::Instant::now().checked_add(timeout) else {
            return self.receive_unbounded(event_type).await;
        };
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(ev)) => {
                    if !self.known_events.insert(ev.id) {
                        continue;
                    }
                    if ev.event_type == event_type {
                        return Some(ev);
                    }
                    self.pending.push_back(ev);
                }
                Ok(None) => {
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    async fn receive_unbounded(&mut self, event_type: &str) -> Option<ExternalEvent> {
        while let Some(ev) = self.events.recv().await {
            if !self.known_events.insert(ev.id) {
                continue;
            }
            if ev.event_type == event_type {
                return Some(ev);
            }
            self.pending.push_back(ev);
        }
        // Sender gone: nothing can ever arrive.
        std::future::pending().await
    }
}
