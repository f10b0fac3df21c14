use crate::plan::{PlanStep, StatusUpdate};
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};

/// Outcome of evaluating one agent response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    /// Keep iterating, after applying the updates and optional restructure.
    Continue {
        #[serde(default, rename = "statusUpdates")]
        status_updates: Vec<StatusUpdate>,
        #[serde(default, rename = "planRestructure", skip_serializing_if = "Option::is_none")]
        restructure: Option<Vec<PlanStep>>,
    },
    /// The task is done; `summary` becomes the instance result.
    Completed {
        #[serde(default, rename = "statusUpdates")]
        status_updates: Vec<StatusUpdate>,
        summary: String,
    },
    /// The task cannot be finished.
    Failed { reason: String },
}

impl Verdict {
    pub fn continue_with(status_updates: Vec<StatusUpdate>) -> Self {
        Verdict::Continue {
            status_updates,
            restructure: None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Continue { .. } => "continue",
            Verdict::Completed { .. } => "completed",
            Verdict::Failed { .. } => "failed",
        }
    }
}

/// Flat verdict shape returned by the reasoning service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictReply {
    pub verdict: String,
    #[serde(default)]
    pub status_updates: Vec<StatusUpdate>,
    #[serde(default)]
    pub plan_restructure: Option<Vec<PlanStep>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TryFrom<VerdictReply> for Verdict {
    type Error = MaestroError;

    fn try_from(reply: VerdictReply) -> MaestroResult<Self> {
        match reply.verdict.to_ascii_lowercase().as_str() {
            "continue" => Ok(Verdict::Continue {
                status_updates: reply.status_updates,
                restructure: reply.plan_restructure,
            }),
            "completed" => Ok(Verdict::Completed {
                status_updates: reply.status_updates,
                summary: reply.summary.unwrap_or_default(),
            }),
            "failed" => Ok(Verdict::Failed {
                reason: reply
                    .reason
                    .unwrap_or_else(|| "reasoner reported failure".to_string()),
            }),
            other => Err(MaestroError::Plan(format!("unknown verdict '{other}'"))),
        }
    }
}
