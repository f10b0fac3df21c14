//! Durable workflow engine for Maestro.
//!
//! Workflow logic runs as a sequence of checkpointed steps. The engine keeps
//! each instance's append-only checkpoint log in the state store; after a
//! crash, a new engine replays the log so completed steps return their
//! recorded results without executing again.
//!
//! # Main types
//!
//! - [`WorkflowEngine`]: starts, signals, cancels and recovers instances.
//! - [`Workflow`]: trait implemented by durable workflow logic.
//! - [`WorkflowContext`]: per-instance handle for steps, event waits and state.
//! - [`WorkflowInstance`]: the persisted instance record.

/// Per-instance durable execution context.
pub mod context;
/// Engine, worker pool and recovery.
pub mod engine;
/// Persisted instance record and checkpoint log.
pub mod instance;

pub use context::{EventOutcome, WorkflowContext};
pub use engine::{EngineConfig, Workflow, WorkflowEngine};
pub use instance::{Checkpoint, ExternalEvent, InstanceError, InstanceStatus, WorkflowInstance};
