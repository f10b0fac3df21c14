use crate::evaluator::{EvaluationInput, ProgressEvaluator};
use crate::plan::PlanStep;
use crate::state::TaskRecord;
use crate::verdict::{Verdict, VerdictReply};
use async_trait::async_trait;
use maestro_core::{AgentTaskResponse, MaestroError, MaestroResult};
use maestro_store::AgentMetadata;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    pub task: String,
    pub plan: Vec<PlanStep>,
    pub agents: Vec<AgentMetadata>,
    pub history: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectReply {
    pub agent: String,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub plan: Option<Vec<PlanStep>>,
    /// Plan entry the agent should work on; the next open entry when absent.
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub substep: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRef {
    pub step: u32,
    pub substep: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub task: String,
    pub plan: Vec<PlanStep>,
    pub step: StepRef,
    pub response: AgentTaskResponse,
}

/// How the run ended, as reported to [`Reasoner::summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeRequest {
    pub task: String,
    pub plan: Vec<PlanStep>,
    pub history: Vec<TaskRecord>,
    pub outcome: RunOutcome,
    /// Final result on completion, the error message on failure.
    pub detail: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeReply {
    pub summary: String,
}

/// External reasoning used by the plan-driven configuration.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn select(&self, request: &SelectRequest) -> MaestroResult<SelectReply>;
    async fn evaluate(&self, request: &EvaluateRequest) -> MaestroResult<VerdictReply>;
    async fn summarize(&self, request: &SummarizeRequest) -> MaestroResult<SummarizeReply>;
}

/// Reasoner reached over HTTP at `{base_url}/select`, `{base_url}/evaluate`
/// and `{base_url}/summarize`.
pub struct HttpReasoner {
    base_url: String,
    http: reqwest::Client,
}

impl HttpReasoner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post<B, R>(&self, route: &str, body: &B) -> MaestroResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{route}", self.base_url);
        debug!(url = %url, "Calling reasoner");
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| MaestroError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(MaestroError::Http(format!(
                "reasoner /{route} returned {status}: {text}"
            )));
        }
        resp.json::<R>()
            .await
            .map_err(|e| MaestroError::Http(format!("invalid reasoner reply from /{route}: {e}")))
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn select(&self, request: &SelectRequest) -> MaestroResult<SelectReply> {
        self.post("select", request).await
    }

    async fn evaluate(&self, request: &EvaluateRequest) -> MaestroResult<VerdictReply> {
        self.post("evaluate", request).await
    }

    async fn summarize(&self, request: &SummarizeRequest) -> MaestroResult<SummarizeReply> {
        self.post("summarize", request).await
    }
}

/// [`ProgressEvaluator`] backed by a [`Reasoner`].
pub struct ReasonerEvaluator {
    reasoner: Arc<dyn Reasoner>,
}

impl ReasonerEvaluator {
    pub fn new(reasoner: Arc<dyn Reasoner>) -> Self {
        Self { reasoner }
    }
}

#[async_trait]
impl ProgressEvaluator for ReasonerEvaluator {
    async fn evaluate(&self, input: &EvaluationInput<'_>) -> MaestroResult<Verdict> {
        let reply = self
            .reasoner
            .evaluate(&EvaluateRequest {
                task: input.task.to_string(),
                plan: input.plan.steps().to_vec(),
                step: StepRef {
                    step: input.step,
                    substep: input.substep,
                },
                response: input.response.clone(),
            })
            .await?;
        Verdict::try_from(reply)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use maestro_core::TaskStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_select_posts_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/select"))
            .and(body_partial_json(json!({"task": "write a poem"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "agent": "Poet",
                "instruction": "write four lines",
                "plan": [{"step": 1, "description": "draft"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reasoner = HttpReasoner::new(format!("{}/", server.uri()));
        let reply = reasoner
            .select(&SelectRequest {
                task: "write a poem".into(),
                plan: Plan::initial("write a poem").steps().to_vec(),
                agents: vec![AgentMetadata::new("Poet", "writer", "agents.Poet.inbox")],
                history: vec![],
            })
            .await
            .unwrap();
        assert_eq!(reply.agent, "Poet");
        assert_eq!(reply.instruction.as_deref(), Some("write four lines"));
        assert_eq!(reply.plan.unwrap().len(), 1);
        assert_eq!(reply.step, None);
    }

    #[tokio::test]
    async fn test_summarize_posts_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/summarize"))
            .and(body_partial_json(json!({"outcome": "failed", "detail": "Task failed: no rhyme"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "summary": "two stanzas drafted, rhyme scheme unresolved"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = HttpReasoner::new(server.uri())
            .summarize(&SummarizeRequest {
                task: "write a poem".into(),
                plan: Plan::initial("write a poem").steps().to_vec(),
                history: vec![],
                outcome: RunOutcome::Failed,
                detail: "Task failed: no rhyme".into(),
            })
            .await
            .unwrap();
        assert!(reply.summary.starts_with("two stanzas"));
    }

    #[tokio::test]
    async fn test_evaluator_maps_reply_to_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/evaluate"))
            .and(body_partial_json(json!({"step": {"step": 1}, "response": {"status": "OK"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "verdict": "completed",
                "statusUpdates": [{"step": 1, "status": "COMPLETED"}],
                "summary": "a poem"
            })))
            .mount(&server)
            .await;

        let evaluator = ReasonerEvaluator::new(Arc::new(HttpReasoner::new(server.uri())));
        let plan = Plan::initial("write a poem");
        let response = AgentTaskResponse {
            instance_id: "wf".into(),
            from_agent: "Poet".into(),
            result: "roses".into(),
            status: TaskStatus::Ok,
            step: 1,
            substep: None,
            attempt: 1,
        };
        let verdict = evaluator
            .evaluate(&EvaluationInput {
                task: "write a poem",
                plan: &plan,
                step: 1,
                substep: None,
                response: &response,
                history: &[],
            })
            .await
            .unwrap();
        assert_eq!(verdict.label(), "completed");
    }

    #[tokio::test]
    async fn test_server_error_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = HttpReasoner::new(server.uri())
            .select(&SelectRequest {
                task: "t".into(),
                plan: vec![],
                agents: vec![],
                history: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HttpError");
        assert!(err.to_string().contains("overloaded"));
    }
}
