use chrono::{DateTime, Utc};
use maestro_core::MaestroError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a workflow instance. Terminal once it leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "RUNNING"),
            InstanceStatus::Completed => write!(f, "COMPLETED"),
            InstanceStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Error recorded on a failed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceError {
    pub code: String,
    pub message: String,
}

impl From<&MaestroError> for InstanceError {
    fn from(e: &MaestroError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// One entry of the append-only checkpoint log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub seq: usize,
    pub name: String,
    pub result: serde_json::Value,
    /// Set when this checkpoint consumed an external event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// An event raised from outside and not yet consumed by the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl ExternalEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            raised_at: Utc::now(),
        }
    }
}

/// The persisted record of one workflow run, stored at `workflow/{id}/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub workflow: String,
    pub status: InstanceStatus,
    pub input: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<InstanceError>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Workflow-defined state, written through [`crate::WorkflowContext::set_state`].
    #[serde(default)]
    pub custom_state: serde_json::Value,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Raised events awaiting consumption.
    #[serde(default)]
    pub inbox: Vec<ExternalEvent>,
}

impl WorkflowInstance {
    pub fn new(workflow: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            workflow: workflow.into(),
            status: InstanceStatus::Running,
            input: input.into(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            cancel_requested: false,
            custom_state: serde_json::Value::Null,
            checkpoints: Vec::new(),
            inbox: Vec::new(),
        }
    }

    /// Transition to `Completed`. No-op once terminal.
    pub fn complete(&mut self, result: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = InstanceStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        self.inbox.clear();
    }

    /// Transition to `Failed`. No-op once terminal.
    pub fn fail(&mut self, error: &MaestroError) {
        if self.status.is_terminal() {
            return;
        }
        self.status = InstanceStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        self.inbox.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_instances_are_immutable() {
        let mut inst = WorkflowInstance::new("orchestrator", "add 1 and 1");
        assert_eq!(inst.status, InstanceStatus::Running);

        inst.fail(&MaestroError::UnknownAgent("GhostAgent".into()));
        assert_eq!(inst.status, InstanceStatus::Failed);
        let failed_at = inst.completed_at;

        inst.complete("2".into());
        assert_eq!(inst.status, InstanceStatus::Failed);
        assert!(inst.result.is_none());
        assert_eq!(inst.completed_at, failed_at);
        assert_eq!(inst.error.as_ref().unwrap().code, "UnknownAgentError");
    }

    #[test]
    fn test_status_wire_format() {
        let inst = WorkflowInstance::new("orchestrator", "x");
        let v = serde_json::to_value(&inst).unwrap();
        assert_eq!(v["status"], "RUNNING");
        assert!(v.get("instanceId").is_some());
        assert!(v.get("cancelRequested").is_some());
    }
}
