//! Topic naming.

/// Shared topic every participant subscribes to for status fan-out.
pub const BROADCAST: &str = "agents.broadcast";

/// `agents.{name}.inbox`
pub fn agent_inbox(agent: &str) -> String {
    format!("agents.{agent}.inbox")
}

/// `orchestrators.{name}.responses`
pub fn orchestrator_responses(orchestrator: &str) -> String {
    format!("orchestrators.{orchestrator}.responses")
}
