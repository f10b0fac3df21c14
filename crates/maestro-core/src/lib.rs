//! Core types and error definitions for the Maestro orchestration workspace.
//!
//! This crate holds what every other Maestro crate agrees on: the error
//! taxonomy, the JSON schemas exchanged over the message bus, the conversation
//! records agents persist, and the retry policy shared by all layers.
//!
//! # Main types
//!
//! - [`MaestroError`] / [`MaestroResult`]: unified error enum with stable codes.
//! - [`BusMessage`]: tagged union of [`TriggerAction`], [`AgentTaskResponse`]
//!   and [`BroadcastMessage`].
//! - [`Turn`] and [`ToolInvocation`]: agent conversation records.
//! - [`RetryPolicy`] and [`retry_with_backoff`]: capped exponential backoff.

/// Conversation turns and tool invocation records.
pub mod conversation;
/// Error taxonomy.
pub mod error;
/// Bus message schemas.
pub mod message;
/// Retry and backoff.
pub mod retry;

pub use conversation::{ToolInvocation, Turn, TurnRole};
pub use error::{MaestroError, MaestroResult};
pub use message::{AgentTaskResponse, BroadcastMessage, BusMessage, TaskStatus, TriggerAction};
pub use retry::{compute_backoff, retry_with_backoff, RetryPolicy};
