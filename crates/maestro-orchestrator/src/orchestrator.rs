use crate::evaluator::{EvaluationInput, ProgressEvaluator};
use crate::plan::{step_label, Plan, StepId};
use crate::reasoner::{Reasoner, RunOutcome, SummarizeRequest};
use crate::state::{OrchestratorState, Phase, RecordStatus, TaskRecord};
use crate::strategy::{Selection, SelectionContext, SelectionStrategy};
use crate::verdict::Verdict;
use async_trait::async_trait;
use maestro_bus::{topics, MessageBus};
use maestro_core::{
    retry_with_backoff, AgentTaskResponse, BroadcastMessage, BusMessage, MaestroError,
    MaestroResult, RetryPolicy, TriggerAction,
};
use maestro_store::{AgentMetadata, AgentRegistry};
use maestro_workflow::{EventOutcome, Workflow, WorkflowContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Event type under which agent responses are raised on an instance.
pub const RESPONSE_EVENT: &str = "AgentTaskResponse";

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workflow name, registry name and response-topic suffix.
    pub name: String,
    pub max_iterations: u32,
    /// How long to wait for one dispatch attempt to be answered.
    pub response_timeout: Duration,
    /// Re-dispatches to the same agent after a timeout.
    pub max_dispatch_retries: u32,
    /// Registry entries silent for longer are not selected; zero disables.
    pub liveness_timeout: Duration,
    /// Applied to bus publishes.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "maestro".to_string(),
            max_iterations: 10,
            response_timeout: Duration::from_secs(60),
            max_dispatch_retries: 3,
            liveness_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Plan-tracking orchestrator, run as a durable workflow.
///
/// Each iteration selects an agent for the next open plan entry, sends it a
/// [`TriggerAction`], waits for the matching [`AgentTaskResponse`] and lets
/// the [`ProgressEvaluator`] decide whether to continue, complete or fail.
/// Registry reads, selection, publishing and evaluation are checkpointed
/// steps, so a recovered instance resumes without re-dispatching.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<dyn MessageBus>,
    registry: AgentRegistry,
    strategy: Arc<dyn SelectionStrategy>,
    evaluator: Arc<dyn ProgressEvaluator>,
    summarizer: Option<Arc<dyn Reasoner>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        bus: Arc<dyn MessageBus>,
        registry: AgentRegistry,
        strategy: Arc<dyn SelectionStrategy>,
        evaluator: Arc<dyn ProgressEvaluator>,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            strategy,
            evaluator,
            summarizer: None,
        }
    }

    /// Produce the final result, and annotate bounded or failed runs, with
    /// the reasoner's summary of the whole run.
    pub fn with_summarizer(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.summarizer = Some(reasoner);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn reply_topic(&self) -> String {
        topics::orchestrator_responses(&self.config.name)
    }

    /// Announce this orchestrator in the registry. It is never selectable.
    pub async fn register(&self) -> MaestroResult<AgentMetadata> {
        self.registry
            .register(
                AgentMetadata::new(&self.config.name, "orchestrator", self.reply_topic())
                    .as_orchestrator(),
            )
            .await
    }

    async fn drive(
        &self,
        ctx: &mut WorkflowContext,
        task: &str,
        state: &mut OrchestratorState,
    ) -> MaestroResult<String> {
        let instance_id = ctx.instance_id().to_string();

        for iteration in 1..=self.config.max_iterations {
            if ctx.is_cancel_requested() {
                info!(instance_id = %instance_id, iteration, "Cancellation observed while planning");
                return Err(MaestroError::Cancelled);
            }
            state.iteration = iteration;
            state.phase = Phase::Planning;
            if state.plan.is_empty() {
                state.plan = Plan::initial(task);
            }
            let Some(target) = state.plan.next_actionable().cloned() else {
                let result = last_result(state, task);
                return self.finalize(ctx, state, task, result).await;
            };
            state.current = Some(target.id());
            ctx.set_state(&*state).await?;

            state.phase = Phase::Dispatching;
            let liveness = self.config.liveness_timeout;
            let agents: Vec<AgentMetadata> = ctx
                .step(&format!("agents:{iteration}"), move || async move {
                    self.registry.list_selectable(liveness).await
                })
                .await?;

            let selection: Selection = {
                let sel_ctx = SelectionContext {
                    task,
                    plan: &state.plan,
                    step: &target,
                    agents: &agents,
                    history: &state.history,
                    dispatch_index: state.dispatches,
                };
                ctx.step(&format!("select:{iteration}"), move || async move {
                    self.strategy.select(&sel_ctx).await
                })
                .await?
            };

            let Some(agent) = agents.iter().find(|a| a.name == selection.agent) else {
                error!(
                    instance_id = %instance_id,
                    agent = %selection.agent,
                    strategy = self.strategy.name(),
                    "Strategy selected an agent missing from the registry"
                );
                return Err(MaestroError::UnknownAgent(selection.agent));
            };

            let mut target = target;
            if let Some(steps) = selection.plan.clone() {
                state.plan.restructure(steps)?;
                match state.plan.next_actionable() {
                    Some(next) => target = next.clone(),
                    None => {
                        let result = last_result(state, task);
                        return self.finalize(ctx, state, task, result).await;
                    }
                }
            }
            if let Some(step) = selection.step {
                let chosen = (step, selection.substep);
                match state.plan.actionable(chosen.0, chosen.1) {
                    Some(entry) => target = entry.clone(),
                    None => {
                        warn!(
                            instance_id = %instance_id,
                            iteration,
                            step = %step_label(chosen),
                            agent = %agent.name,
                            "Selected step is not open in the plan, nothing dispatched"
                        );
                        state.current = None;
                        ctx.set_state(&*state).await?;
                        continue;
                    }
                }
            }

            let id = target.id();
            state.current = Some(id);
            state.plan.mark_dispatched(id.0, id.1, &agent.name)?;
            state.dispatches += 1;
            let instruction = selection
                .instruction
                .clone()
                .unwrap_or_else(|| target.description.clone());

            let response = self
                .dispatch_and_wait(ctx, state, agent, iteration, id, &instruction, task)
                .await?;

            if ctx.is_cancel_requested() {
                info!(instance_id = %instance_id, iteration, "Cancellation observed before evaluation");
                return Err(MaestroError::Cancelled);
            }
            state.history.push(TaskRecord::from_response(&response));
            state.phase = Phase::Evaluating;
            ctx.set_state(&*state).await?;

            let verdict: Verdict = {
                let input = EvaluationInput {
                    task,
                    plan: &state.plan,
                    step: id.0,
                    substep: id.1,
                    response: &response,
                    history: &state.history,
                };
                ctx.step(&format!("evaluate:{iteration}"), move || async move {
                    self.evaluator.evaluate(&input).await
                })
                .await?
            };
            info!(
                instance_id = %instance_id,
                iteration,
                step = %step_label(id),
                verdict = verdict.label(),
                "Response evaluated"
            );

            match verdict {
                Verdict::Continue {
                    status_updates,
                    restructure,
                } => {
                    state.plan.apply_status_updates(&status_updates)?;
                    if let Some(steps) = restructure {
                        state.plan.restructure(steps)?;
                    }
                    state.current = None;
                }
                Verdict::Completed {
                    status_updates,
                    summary,
                } => {
                    state.plan.apply_status_updates(&status_updates)?;
                    return self.finalize(ctx, state, task, summary).await;
                }
                Verdict::Failed { reason } => return Err(MaestroError::TaskFailed(reason)),
            }
        }

        warn!(
            instance_id = %instance_id,
            max_iterations = self.config.max_iterations,
            "Iteration bound reached"
        );
        Err(MaestroError::MaxIterationsExceeded {
            limit: self.config.max_iterations,
            summary: None,
        })
    }

    /// Dispatch `id` to `agent` until a matching response arrives or every
    /// attempt has timed out.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_and_wait(
        &self,
        ctx: &mut WorkflowContext,
        state: &mut OrchestratorState,
        agent: &AgentMetadata,
        iteration: u32,
        id: StepId,
        instruction: &str,
        task: &str,
    ) -> MaestroResult<AgentTaskResponse> {
        let instance_id = ctx.instance_id().to_string();
        let attempts = self.config.max_dispatch_retries + 1;
        let plan_context = serde_json::to_value(state.plan.steps())?;
        let announce = state.dispatches == 1;
        // Attempt numbers keep growing across iterations so every dispatch of
        // a step has a fresh dedup key.
        let prior = state.history.iter().filter(|r| r.id() == id).count() as u32;

        for n in 1..=attempts {
            let attempt = prior + n;
            state.phase = Phase::Dispatching;
            let trigger = TriggerAction {
                instance_id: instance_id.clone(),
                target_agent: agent.name.clone(),
                task: instruction.to_string(),
                plan_context: plan_context.clone(),
                step: id.0,
                substep: id.1,
                attempt,
                reply_topic: self.reply_topic(),
            };
            let announce = announce && n == 1;
            let _key: String = ctx
                .step(&format!("dispatch:{iteration}:{n}"), move || async move {
                    self.dispatch(&trigger, &agent.inbound_topic, announce, task)
                        .await
                })
                .await?;

            state.phase = Phase::AwaitingResponse;
            ctx.set_state(&*state).await?;

            // `None` when the timeout is too large to represent: wait forever.
            let deadline = Instant::now().checked_add(self.config.response_timeout);
            loop {
                let remaining = deadline.map_or(self.config.response_timeout, |d| {
                    d.saturating_duration_since(Instant::now())
                });
                match ctx.wait_for_event(RESPONSE_EVENT, remaining).await? {
                    EventOutcome::Timeout => break,
                    EventOutcome::Received(payload) => {
                        match serde_json::from_value::<AgentTaskResponse>(payload) {
                            Ok(resp)
                                if resp.from_agent == agent.name
                                    && resp.answers(id.0, id.1, attempt) =>
                            {
                                debug!(
                                    instance_id = %instance_id,
                                    agent = %agent.name,
                                    status = %resp.status,
                                    "Response received"
                                );
                                return Ok(resp);
                            }
                            Ok(resp) => debug!(
                                instance_id = %instance_id,
                                from = %resp.from_agent,
                                step = resp.step,
                                attempt = resp.attempt,
                                "Discarding stale response"
                            ),
                            Err(e) => warn!(instance_id = %instance_id, error = %e, "Discarding malformed response"),
                        }
                    }
                }
            }

            warn!(
                instance_id = %instance_id,
                agent = %agent.name,
                step = %step_label(id),
                attempt,
                remaining = attempts - n,
                "No response before timeout"
            );
            state.history.push(TaskRecord::timeout(&agent.name, id, attempt));
        }

        Err(MaestroError::AgentResponseTimeout {
            agent: agent.name.clone(),
            attempts,
        })
    }

    async fn dispatch(
        &self,
        trigger: &TriggerAction,
        inbox: &str,
        announce: bool,
        task: &str,
    ) -> MaestroResult<String> {
        if announce {
            self.broadcast(&trigger.instance_id, format!("New task: {task}"))
                .await?;
        }
        self.publish(inbox, trigger.clone().into()).await?;
        let step = step_label((trigger.step, trigger.substep));
        self.broadcast(
            &trigger.instance_id,
            format!(
                "{} dispatched step {step} to {} (attempt {})",
                self.config.name, trigger.target_agent, trigger.attempt
            ),
        )
        .await?;
        info!(
            instance_id = %trigger.instance_id,
            agent = %trigger.target_agent,
            step = %step,
            attempt = trigger.attempt,
            "Trigger dispatched"
        );
        Ok(trigger.dedup_key())
    }

    async fn finalize(
        &self,
        ctx: &mut WorkflowContext,
        state: &mut OrchestratorState,
        task: &str,
        result: String,
    ) -> MaestroResult<String> {
        state.phase = Phase::Finalizing;
        state.current = None;
        ctx.set_state(&*state).await?;

        let summary = self
            .summarize(ctx, state, task, RunOutcome::Completed, &result)
            .await?
            .unwrap_or(result);
        let instance_id = ctx.instance_id().to_string();
        let message = format!("{} completed the task: {summary}", self.config.name);
        ctx.step("finalize", move || async move {
            self.broadcast(&instance_id, message).await
        })
        .await?;

        state.phase = Phase::Completed;
        state.summary = Some(summary.clone());
        ctx.set_state(&*state).await?;
        Ok(summary)
    }

    /// Ask the summarizer for a wrap-up of the run, checkpointed as
    /// `summarize`. An unreachable summarizer yields `None`.
    async fn summarize(
        &self,
        ctx: &mut WorkflowContext,
        state: &OrchestratorState,
        task: &str,
        outcome: RunOutcome,
        detail: &str,
    ) -> MaestroResult<Option<String>> {
        let Some(reasoner) = self.summarizer.clone() else {
            return Ok(None);
        };
        let request = SummarizeRequest {
            task: task.to_string(),
            plan: state.plan.steps().to_vec(),
            history: state.history.clone(),
            outcome,
            detail: detail.to_string(),
        };
        let instance_id = ctx.instance_id().to_string();
        ctx.step("summarize", move || async move {
            match reasoner.summarize(&request).await {
                Ok(reply) => Ok(Some(reply.summary)),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Summary unavailable");
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Attach a run summary to bounded and failed outcomes. Other errors, and
    /// any trouble summarizing, leave `err` unchanged.
    async fn summarize_failure(
        &self,
        ctx: &mut WorkflowContext,
        state: &mut OrchestratorState,
        task: &str,
        err: MaestroError,
    ) -> MaestroError {
        if !matches!(
            err,
            MaestroError::TaskFailed(_) | MaestroError::MaxIterationsExceeded { .. }
        ) {
            return err;
        }
        let summary = match self
            .summarize(ctx, state, task, RunOutcome::Failed, &err.to_string())
            .await
        {
            Ok(Some(summary)) => summary,
            Ok(None) => return err,
            Err(e) => {
                warn!(instance_id = %ctx.instance_id(), error = %e, "Failed to record failure summary");
                return err;
            }
        };
        state.summary = Some(summary.clone());
        match err {
            MaestroError::TaskFailed(reason) => {
                MaestroError::TaskFailed(format!("{reason}. Summary: {summary}"))
            }
            MaestroError::MaxIterationsExceeded { limit, .. } => {
                MaestroError::MaxIterationsExceeded {
                    limit,
                    summary: Some(summary),
                }
            }
            other => other,
        }
    }

    async fn broadcast(&self, instance_id: &str, summary: String) -> MaestroResult<()> {
        let message = BroadcastMessage {
            instance_id: instance_id.to_string(),
            from_agent: self.config.name.clone(),
            summary,
        };
        self.publish(topics::BROADCAST, message.into()).await
    }

    async fn publish(&self, topic: &str, message: BusMessage) -> MaestroResult<()> {
        retry_with_backoff(&self.config.retry, "orchestrator.publish", || {
            self.bus.publish(topic, &self.config.name, message.clone())
        })
        .await?;
        Ok(())
    }
}

/// Most recent successful result, or the task itself.
fn last_result(state: &OrchestratorState, task: &str) -> String {
    state
        .history
        .iter()
        .rev()
        .find(|r| r.status == RecordStatus::Ok)
        .map_or_else(|| task.to_string(), |r| r.result.clone())
}

#[async_trait]
impl Workflow for Orchestrator {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, ctx: &mut WorkflowContext, input: String) -> MaestroResult<String> {
        let mut state = OrchestratorState::default();
        info!(
            instance_id = %ctx.instance_id(),
            orchestrator = %self.config.name,
            strategy = self.strategy.name(),
            replaying = ctx.is_replaying(),
            "Orchestrator instance running"
        );

        match self.drive(ctx, &input, &mut state).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                let e = self.summarize_failure(ctx, &mut state, &input, e).await;
                state.phase = Phase::Failed;
                state.failed_step = state.current;
                if let Err(persist) = ctx.set_state(&state).await {
                    warn!(instance_id = %ctx.instance_id(), error = %persist, "Failed to persist failure state");
                }
                error!(
                    instance_id = %ctx.instance_id(),
                    code = e.code(),
                    error = %e,
                    failed_step = ?state.failed_step,
                    "Orchestrator instance failed"
                );
                Err(e)
            }
        }
    }
}
