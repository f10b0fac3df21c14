//! State store key layout.

/// Prefix shared by every workflow instance record.
pub const WORKFLOW_PREFIX: &str = "workflow/";

/// Key holding the agent registry map.
pub const REGISTRY_AGENTS: &str = "registry/agents";

/// `workflow/{instanceId}/state`
pub fn workflow_state(instance_id: &str) -> String {
    format!("{WORKFLOW_PREFIX}{instance_id}/state")
}

/// Extracts the instance id from a `workflow/{id}/state` key.
pub fn instance_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(WORKFLOW_PREFIX)?.strip_suffix("/state")
}

/// `agents/{agentName}/session/{sessionId}`
pub fn agent_session(agent: &str, session_id: &str) -> String {
    format!("agents/{agent}/session/{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(workflow_state("wf-1"), "workflow/wf-1/state");
        assert_eq!(
            agent_session("MathAgent", "wf-1"),
            "agents/MathAgent/session/wf-1"
        );
        assert_eq!(instance_id_from_key("workflow/wf-1/state"), Some("wf-1"));
        assert_eq!(instance_id_from_key("registry/agents"), None);
    }
}
