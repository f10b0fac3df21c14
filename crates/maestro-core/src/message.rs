use serde::{Deserialize, Serialize};

/// Outcome reported by an agent for a single trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// The task loop finished and produced a result.
    Ok,
    /// The task loop raised; `result` carries the diagnostic.
    Error,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Ok => write!(f, "OK"),
            TaskStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Directed message from an orchestrator to exactly one agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerAction {
    pub instance_id: String,
    pub target_agent: String,
    pub task: String,
    /// Snapshot of the plan at dispatch time.
    #[serde(default)]
    pub plan_context: serde_json::Value,
    pub step: u32,
    #[serde(default)]
    pub substep: Option<u32>,
    /// Dispatch attempt for this step, starting at 1.
    pub attempt: u32,
    /// Topic the agent must publish its [`AgentTaskResponse`] to.
    pub reply_topic: String,
}

impl TriggerAction {
    /// Key used by agent runtimes to drop redelivered triggers.
    pub fn dedup_key(&self) -> String {
        let substep = self
            .substep
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        format!(
            "{}:{}:{}:{}",
            self.instance_id, self.step, substep, self.attempt
        )
    }
}

/// An agent's answer to a [`TriggerAction`], routed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskResponse {
    pub instance_id: String,
    pub from_agent: String,
    pub result: String,
    pub status: TaskStatus,
    pub step: u32,
    #[serde(default)]
    pub substep: Option<u32>,
    pub attempt: u32,
}

impl AgentTaskResponse {
    /// Build the response for `trigger` with the given outcome.
    pub fn for_trigger(
        trigger: &TriggerAction,
        result: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        Self {
            instance_id: trigger.instance_id.clone(),
            from_agent: trigger.target_agent.clone(),
            result: result.into(),
            status,
            step: trigger.step,
            substep: trigger.substep,
            attempt: trigger.attempt,
        }
    }

    /// Whether this response answers the dispatch identified by the arguments.
    pub fn answers(&self, step: u32, substep: Option<u32>, attempt: u32) -> bool {
        self.step == step && self.substep == substep && self.attempt == attempt
    }
}

/// Status summary fanned out to every broadcast subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub instance_id: String,
    pub from_agent: String,
    pub summary: String,
}

/// Every message that travels over the bus, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    /// Orchestrator to agent.
    TriggerAction(TriggerAction),
    /// Agent to orchestrator.
    AgentTaskResponse(AgentTaskResponse),
    /// Anyone to everyone.
    BroadcastMessage(BroadcastMessage),
}

impl BusMessage {
    /// The workflow instance this message belongs to.
    pub fn instance_id(&self) -> &str {
        match self {
            BusMessage::TriggerAction(m) => &m.instance_id,
            BusMessage::AgentTaskResponse(m) => &m.instance_id,
            BusMessage::BroadcastMessage(m) => &m.instance_id,
        }
    }

    /// Short name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::TriggerAction(_) => "TriggerAction",
            BusMessage::AgentTaskResponse(_) => "AgentTaskResponse",
            BusMessage::BroadcastMessage(_) => "BroadcastMessage",
        }
    }
}

impl From<TriggerAction> for BusMessage {
    fn from(m: TriggerAction) -> Self {
        BusMessage::TriggerAction(m)
    }
}

impl From<AgentTaskResponse> for BusMessage {
    fn from(m: AgentTaskResponse) -> Self {
        BusMessage::AgentTaskResponse(m)
    }
}

impl From<BroadcastMessage> for BusMessage {
    fn from(m: BroadcastMessage) -> Self {
        BusMessage::BroadcastMessage(m)
    }
}
