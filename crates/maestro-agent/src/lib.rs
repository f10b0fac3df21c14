//! Agent runtimes for Maestro.
//!
//! Each agent identity runs as one actor task consuming its inbox topic and
//! the shared broadcast topic. Triggers are executed by a pluggable
//! [`TaskExecutor`]; results go back to the orchestrator that asked.
//!
//! # Main types
//!
//! - [`AgentRuntime`] / [`AgentHandle`]: the actor and its control handle.
//! - [`TaskExecutor`]: the task loop seam, with [`EchoExecutor`] and
//!   [`HttpTaskExecutor`].
//! - [`AgentMonitor`]: per-agent status and counters.

/// Task execution seam and built-in executors.
pub mod executor;
/// Runtime status and counters.
pub mod monitor;
/// The agent actor.
pub mod runtime;

pub use executor::{EchoExecutor, HttpTaskExecutor, TaskExecutor, TaskInput, TaskOutput};
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, AgentStatus};
pub use runtime::{AgentConfig, AgentHandle, AgentRuntime};
