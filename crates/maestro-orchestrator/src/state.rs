use crate::plan::{Plan, StepId};
use chrono::{DateTime, Utc};
use maestro_core::{AgentTaskResponse, TaskStatus};
use serde::{Deserialize, Serialize};

/// Where an orchestrator instance is in its iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Initializing,
    Planning,
    Dispatching,
    AwaitingResponse,
    Evaluating,
    Finalizing,
    Completed,
    Failed,
}

/// Outcome of one dispatch attempt, as kept in the audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Ok,
    Error,
    Timeout,
}

impl From<TaskStatus> for RecordStatus {
    fn from(s: TaskStatus) -> Self {
        match s {
            TaskStatus::Ok => RecordStatus::Ok,
            TaskStatus::Error => RecordStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub agent: String,
    pub step: u32,
    #[serde(default)]
    pub substep: Option<u32>,
    pub attempt: u32,
    pub result: String,
    pub status: RecordStatus,
    pub timestamp: DateTime<Utc>,
}

impl TaskRecord {
    pub fn from_response(response: &AgentTaskResponse) -> Self {
        Self {
            agent: response.from_agent.clone(),
            step: response.step,
            substep: response.substep,
            attempt: response.attempt,
            result: response.result.clone(),
            status: response.status.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(agent: &str, (step, substep): StepId, attempt: u32) -> Self {
        Self {
            agent: agent.to_string(),
            step,
            substep,
            attempt,
            result: String::new(),
            status: RecordStatus::Timeout,
            timestamp: Utc::now(),
        }
    }

    pub fn id(&self) -> StepId {
        (self.step, self.substep)
    }
}

/// Orchestrator state kept in the instance record's custom state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub phase: Phase,
    /// Empty until the first PLANNING phase.
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub history: Vec<TaskRecord>,
    #[serde(default)]
    pub iteration: u32,
    /// Dispatches made so far; drives round-robin.
    #[serde(default)]
    pub dispatches: u64,
    /// Step currently handed to an agent, if any.
    #[serde(default)]
    pub current: Option<StepId>,
    /// Step the instance failed on.
    #[serde(default)]
    pub failed_step: Option<StepId>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            phase: Phase::Initializing,
            plan: Plan::default(),
            history: Vec::new(),
            iteration: 0,
            dispatches: 0,
            current: None,
            failed_step: None,
            summary: None,
        }
    }
}
