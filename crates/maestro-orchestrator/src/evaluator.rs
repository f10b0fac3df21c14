use crate::plan::{Plan, StatusUpdate, StepStatus};
use crate::state::{RecordStatus, TaskRecord};
use crate::verdict::Verdict;
use async_trait::async_trait;
use maestro_core::{AgentTaskResponse, MaestroResult, TaskStatus};

/// Everything an evaluator may look at for one response.
pub struct EvaluationInput<'a> {
    pub task: &'a str,
    pub plan: &'a Plan,
    pub step: u32,
    pub substep: Option<u32>,
    pub response: &'a AgentTaskResponse,
    /// Audit history, including the record for `response`.
    pub history: &'a [TaskRecord],
}

/// Turns an agent response into a [`Verdict`].
#[async_trait]
pub trait ProgressEvaluator: Send + Sync {
    async fn evaluate(&self, input: &EvaluationInput<'_>) -> MaestroResult<Verdict>;
}

/// Evaluator driven purely by response status.
///
/// An OK response completes the dispatched step, and the task once the whole
/// plan is complete. ERROR responses leave the step open for another
/// dispatch until it has failed more than `max_step_errors` times.
pub struct StatusEvaluator {
    max_step_errors: u32,
}

impl StatusEvaluator {
    pub fn new(max_step_errors: u32) -> Self {
        Self { max_step_errors }
    }
}

#[async_trait]
impl ProgressEvaluator for StatusEvaluator {
    async fn evaluate(&self, input: &EvaluationInput<'_>) -> MaestroResult<Verdict> {
        let id = (input.step, input.substep);
        match input.response.status {
            TaskStatus::Ok => {
                let updates = vec![StatusUpdate::new(input.step, input.substep, StepStatus::Completed)];
                let mut projected = input.plan.clone();
                projected.apply_status_updates(&updates)?;
                if projected.is_terminal() {
                    Ok(Verdict::Completed {
                        status_updates: updates,
                        summary: input.response.result.clone(),
                    })
                } else {
                    Ok(Verdict::continue_with(updates))
                }
            }
            TaskStatus::Error => {
                let errors = input
                    .history
                    .iter()
                    .filter(|r| r.id() == id && r.status == RecordStatus::Error)
                    .count() as u32;
                if errors > self.max_step_errors {
                    Ok(Verdict::Failed {
                        reason: format!(
                            "step {} failed {errors} times, last error: {}",
                            input.step, input.response.result
                        ),
                    })
                } else {
                    Ok(Verdict::continue_with(Vec::new()))
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;

    fn response(step: u32, status: TaskStatus, result: &str) -> AgentTaskResponse {
        AgentTaskResponse {
            instance_id: "wf".into(),
            from_agent: "MathAgent".into(),
            result: result.into(),
            status,
            step,
            substep: None,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_ok_on_last_step_completes() {
        let plan = Plan::initial("add 1 and 1");
        let resp = response(1, TaskStatus::Ok, "2");
        let history = vec![TaskRecord::from_response(&resp)];
        let verdict = StatusEvaluator::new(2)
            .evaluate(&EvaluationInput {
                task: "add 1 and 1",
                plan: &plan,
                step: 1,
                substep: None,
                response: &resp,
                history: &history,
            })
            .await
            .unwrap();
        match verdict {
            Verdict::Completed { summary, status_updates } => {
                assert_eq!(summary, "2");
                assert_eq!(status_updates.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ok_with_remaining_steps_continues() {
        let plan = Plan::from_steps(vec![PlanStep::new(1, "a"), PlanStep::new(2, "b")]).unwrap();
        let resp = response(1, TaskStatus::Ok, "done");
        let verdict = StatusEvaluator::new(2)
            .evaluate(&EvaluationInput {
                task: "t",
                plan: &plan,
                step: 1,
                substep: None,
                response: &resp,
                history: &[],
            })
            .await
            .unwrap();
        assert_eq!(verdict.label(), "continue");
    }

    #[tokio::test]
    async fn test_errors_fail_after_budget() {
        let plan = Plan::initial("t");
        let resp = response(1, TaskStatus::Error, "ExecutorError: boom");
        let eval = StatusEvaluator::new(1);

        let mut history = vec![TaskRecord::from_response(&resp)];
        let first = eval
            .evaluate(&EvaluationInput {
                task: "t",
                plan: &plan,
                step: 1,
                substep: None,
                response: &resp,
                history: &history,
            })
            .await
            .unwrap();
        assert_eq!(first, Verdict::continue_with(Vec::new()));

        history.push(TaskRecord::from_response(&resp));
        let second = eval
            .evaluate(&EvaluationInput {
                task: "t",
                plan: &plan,
                step: 1,
                substep: None,
                response: &resp,
                history: &history,
            })
            .await
            .unwrap();
        match second {
            Verdict::Failed { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
