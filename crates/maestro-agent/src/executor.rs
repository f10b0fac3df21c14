use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult, ToolInvocation, Turn, TurnRole};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Everything a task loop gets to see for one trigger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    /// Name of the executing agent.
    pub agent: String,
    /// Instruction for this step.
    pub task: String,
    /// Plan snapshot sent with the trigger.
    pub plan_context: serde_json::Value,
    /// Conversation so far, oldest first. Excludes the current task.
    pub history: Vec<Turn>,
}

/// What a task loop produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Text handed back to the orchestrator.
    pub result: String,
    /// Tools invoked while producing `result`.
    pub tool_calls: Vec<ToolInvocation>,
}

impl TaskOutput {
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// The reasoning/tool loop an agent runs for a trigger.
///
/// An `Err` is not fatal to the runtime: it is reported back to the
/// orchestrator as a response with status `ERROR`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, input: &TaskInput) -> MaestroResult<TaskOutput>;
}

/// Returns the task text unchanged.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, input: &TaskInput) -> MaestroResult<TaskOutput> {
        Ok(TaskOutput::text(input.task.clone()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceReply {
    result: String,
    #[serde(default)]
    tool_calls: Vec<ServiceToolCall>,
    /// `false` asks for another loop iteration with the result fed back.
    #[serde(default = "default_done")]
    done: bool,
}

fn default_done() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ServiceToolCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    output: Option<String>,
}

/// Delegates the task loop to an external HTTP service.
///
/// Each iteration POSTs `{agent, task, planContext, history, iteration}` to
/// the configured URL and expects `{result, toolCalls?, done?}` back. A reply
/// with `done: false` is appended to the history as a tool turn and the
/// service is called again, up to `max_iterations` times.
pub struct HttpTaskExecutor {
    url: String,
    max_iterations: u32,
    http: reqwest::Client,
}

impl HttpTaskExecutor {
    pub fn new(url: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            url: url.into(),
            max_iterations: max_iterations.max(1),
            http: reqwest::Client::new(),
        }
    }

    async fn call(
        &self,
        input: &TaskInput,
        history: &[Turn],
        iteration: u32,
    ) -> MaestroResult<ServiceReply> {
        let body = serde_json::json!({
            "agent": input.agent,
            "task": input.task,
            "planContext": input.plan_context,
            "history": history,
            "iteration": iteration,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MaestroError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(MaestroError::Executor(format!(
                "task service returned {status}: {text}"
            )));
        }

        resp.json::<ServiceReply>()
            .await
            .map_err(|e| MaestroError::Executor(format!("invalid task service reply: {e}")))
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn execute(&self, input: &TaskInput) -> MaestroResult<TaskOutput> {
        let mut history = input.history.clone();
        let mut tool_calls = Vec::new();

        for iteration in 0..self.max_iterations {
            debug!(agent = %input.agent, iteration, "Task loop iteration");
            let reply = self.call(input, &history, iteration).await?;

            for call in reply.tool_calls {
                let mut inv = ToolInvocation::new(call.name, call.arguments);
                inv.output = call.output;
                tool_calls.push(inv);
            }

            if reply.done {
                info!(agent = %input.agent, iterations = iteration + 1, "Task loop finished");
                return Ok(TaskOutput {
                    result: reply.result,
                    tool_calls,
                });
            }
            history.push(Turn::new(TurnRole::Tool, reply.result).with_name(input.agent.clone()));
        }

        Err(MaestroError::Executor(format!(
            "task loop did not finish within {} iterations",
            self.max_iterations
        )))
    }
}
