use crate::plan::{Plan, PlanStep};
use crate::reasoner::{Reasoner, SelectRequest};
use crate::state::TaskRecord;
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use maestro_store::AgentMetadata;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Inputs to one selection decision.
pub struct SelectionContext<'a> {
    pub task: &'a str,
    pub plan: &'a Plan,
    /// The entry about to be dispatched.
    pub step: &'a PlanStep,
    /// Selectable agents, ordered by name.
    pub agents: &'a [AgentMetadata],
    pub history: &'a [TaskRecord],
    /// Dispatches already made by this instance.
    pub dispatch_index: u64,
}

/// The chosen agent, plus optional extras from a plan-aware strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub agent: String,
    /// Instruction to send instead of the step description.
    #[serde(default)]
    pub instruction: Option<String>,
    /// Replacement plan proposed alongside the selection.
    #[serde(default)]
    pub plan: Option<Vec<PlanStep>>,
    /// Plan entry to dispatch instead of the next open one. Must name an open,
    /// dispatchable entry of the (possibly replaced) plan.
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub substep: Option<u32>,
}

impl Selection {
    pub fn agent(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            instruction: None,
            plan: None,
            step: None,
            substep: None,
        }
    }
}

/// Picks the agent for the next dispatch.
///
/// Called inside a checkpointed step, so implementations may be
/// non-deterministic; the recorded choice is what replays.
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &str;
    async fn select(&self, ctx: &SelectionContext<'_>) -> MaestroResult<Selection>;
}

fn ensure_agents(ctx: &SelectionContext<'_>) -> MaestroResult<()> {
    if ctx.agents.is_empty() {
        return Err(MaestroError::Config(
            "no selectable agents in the registry".to_string(),
        ));
    }
    Ok(())
}

/// `agents[dispatch_index % len]`.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy;

#[async_trait]
impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        "round_robin"
    }

    async fn select(&self, ctx: &SelectionContext<'_>) -> MaestroResult<Selection> {
        ensure_agents(ctx)?;
        let idx = (ctx.dispatch_index % ctx.agents.len() as u64) as usize;
        Ok(Selection::agent(&ctx.agents[idx].name))
    }
}

/// Uniform choice among agents whose capabilities meet the step's
/// requirements, avoiding the previous speaker when there is a choice.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    fn candidates<'a>(ctx: &'a SelectionContext<'_>) -> Vec<&'a AgentMetadata> {
        let required: HashSet<&str> = ctx.step.requirements.iter().map(String::as_str).collect();
        let matching: Vec<&AgentMetadata> = if required.is_empty() {
            ctx.agents.iter().collect()
        } else {
            ctx.agents
                .iter()
                .filter(|a| a.capabilities.iter().any(|c| required.contains(c.as_str())))
                .collect()
        };
        let pool = if matching.is_empty() {
            ctx.agents.iter().collect()
        } else {
            matching
        };

        let previous = ctx.history.last().map(|r| r.agent.as_str());
        if pool.len() > 1 {
            if let Some(prev) = previous {
                let fresh: Vec<&AgentMetadata> =
                    pool.iter().copied().filter(|a| a.name != prev).collect();
                if !fresh.is_empty() {
                    return fresh;
                }
            }
        }
        pool
    }
}

#[async_trait]
impl SelectionStrategy for RandomStrategy {
    fn name(&self) -> &str {
        "random"
    }

    async fn select(&self, ctx: &SelectionContext<'_>) -> MaestroResult<Selection> {
        ensure_agents(ctx)?;
        let candidates = Self::candidates(ctx);
        let chosen = candidates
            .choose(&mut rand::thread_rng())
            .map(|a| a.name.clone())
            .ok_or_else(|| MaestroError::Config("no candidate agents".to_string()))?;
        Ok(Selection::agent(chosen))
    }
}

/// Delegates the choice to an external reasoning service.
pub struct PlanDrivenStrategy {
    reasoner: Arc<dyn Reasoner>,
}

impl PlanDrivenStrategy {
    pub fn new(reasoner: Arc<dyn Reasoner>) -> Self {
        Self { reasoner }
    }
}

#[async_trait]
impl SelectionStrategy for PlanDrivenStrategy {
    fn name(&self) -> &str {
        "plan_driven"
    }

    async fn select(&self, ctx: &SelectionContext<'_>) -> MaestroResult<Selection> {
        ensure_agents(ctx)?;
        let reply = self
            .reasoner
            .select(&SelectRequest {
                task: ctx.task.to_string(),
                plan: ctx.plan.steps().to_vec(),
                agents: ctx.agents.to_vec(),
                history: ctx.history.to_vec(),
            })
            .await?;
        Ok(Selection {
            agent: reply.agent,
            instruction: reply.instruction,
            plan: reply.plan,
            step: reply.step,
            substep: reply.substep,
        })
    }
}
