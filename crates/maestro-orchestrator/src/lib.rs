//! Plan-tracking orchestration for Maestro.
//!
//! An [`Orchestrator`] is a durable workflow: it keeps a hierarchical
//! [`Plan`], picks agents with a [`SelectionStrategy`], dispatches trigger
//! messages over the bus and turns each response into a [`Verdict`] through a
//! [`ProgressEvaluator`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: the workflow, registered with a `WorkflowEngine`.
//! - [`Plan`]: the plan tracker (pure data).
//! - [`RoundRobinStrategy`], [`RandomStrategy`], [`PlanDrivenStrategy`]: agent selection.
//! - [`StatusEvaluator`], [`ReasonerEvaluator`]: response evaluation.
//! - [`spawn_response_router`]: bridges the response topic to instance events.

/// Response evaluation.
pub mod evaluator;
/// The orchestrator workflow.
pub mod orchestrator;
/// Plan tracker.
pub mod plan;
/// External reasoning service client.
pub mod reasoner;
/// Response topic to workflow event bridge.
pub mod router;
/// Persisted orchestrator state and audit history.
pub mod state;
/// Agent selection strategies.
pub mod strategy;
/// Evaluation verdicts.
pub mod verdict;

pub use evaluator::{EvaluationInput, ProgressEvaluator, StatusEvaluator};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RESPONSE_EVENT};
pub use plan::{Plan, PlanStep, StatusUpdate, StepId, StepStatus};
pub use reasoner::{
    EvaluateRequest, HttpReasoner, Reasoner, ReasonerEvaluator, RunOutcome, SelectReply,
    SelectRequest, SummarizeReply, SummarizeRequest,
};
pub use router::spawn_response_router;
pub use state::{OrchestratorState, Phase, RecordStatus, TaskRecord};
pub use strategy::{
    PlanDrivenStrategy, RandomStrategy, RoundRobinStrategy, Selection, SelectionContext,
    SelectionStrategy,
};
pub use verdict::{Verdict, VerdictReply};
