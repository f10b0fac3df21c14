//! HTTP gateway for Maestro.
//!
//! Exposes the start-workflow endpoint plus read-only views of workflow
//! instances and the agent registry, with optional API-key auth.

/// API-key authentication.
pub mod middleware;
/// Routes, handlers and the JSON error type.
pub mod server;

pub use middleware::ApiKeys;
pub use server::{ApiError, AppState, GatewayServer, InstanceView, StartWorkflowResponse};
