use thiserror::Error;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the orchestration core.
///
/// Variants are grouped by the taxonomy the engine relies on: transient
/// failures ([`MaestroError::is_retryable`]) are retried by the layer that
/// issued the call, configuration failures are fatal, and everything else is
/// surfaced as a terminal step failure with a stable [`code`](MaestroError::code).
#[derive(Error, Debug)]
pub enum MaestroError {
    /// Caller supplied an empty or malformed input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The state store could not be reached or timed out.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// A per-key precondition (etag) did not hold during read-modify-write.
    #[error("Write conflict on key '{key}'")]
    Conflict { key: String },

    /// Publishing to the message bus failed.
    #[error("Bus publish failed on topic '{topic}': {reason}")]
    BusPublish { topic: String, reason: String },

    /// A selection strategy produced an agent that is not in the registry.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// The selected agent never answered within the timeout and retry budget.
    #[error("Agent '{agent}' did not respond after {attempts} attempt(s)")]
    AgentResponseTimeout { agent: String, attempts: u32 },

    /// The orchestrator hit its iteration bound without a terminal verdict.
    #[error("Max iterations ({limit}) exceeded{}", summary_suffix(.summary))]
    MaxIterationsExceeded {
        /// Configured iteration bound.
        limit: u32,
        /// What was achieved before giving up, when a summary was produced.
        summary: Option<String>,
    },

    /// The evaluation phase returned a `failed` verdict.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// The instance was cancelled externally.
    #[error("Workflow instance cancelled")]
    Cancelled,

    /// A plan mutation was rejected.
    #[error("Plan error: {0}")]
    Plan(String),

    /// A replayed workflow asked for a different step than the one recorded.
    #[error("Non-deterministic replay at step {seq}: expected '{expected}', got '{actual}'")]
    NonDeterminism {
        seq: usize,
        expected: String,
        actual: String,
    },

    /// A requested entity (instance, agent, key) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A gateway request carried no accepted API key.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration parsing or validation error.
    #[error("Config error: {0}")]
    Config(String),

    /// An agent's task executor failed.
    #[error("Executor error: {0}")]
    Executor(String),

    /// An outbound HTTP call failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn summary_suffix(summary: &Option<String>) -> String {
    summary
        .as_deref()
        .map(|s| format!(". Summary: {s}"))
        .unwrap_or_default()
}

impl MaestroError {
    /// Stable, user-visible error code recorded on failed instances.
    pub fn code(&self) -> &'static str {
        match self {
            MaestroError::InvalidInput(_) => "InvalidInputError",
            MaestroError::StoreUnavailable(_) => "StoreUnavailableError",
            MaestroError::Conflict { .. } => "ConflictError",
            MaestroError::BusPublish { .. } => "BusPublishError",
            MaestroError::UnknownAgent(_) => "UnknownAgentError",
            MaestroError::AgentResponseTimeout { .. } => "AgentResponseTimeout",
            MaestroError::MaxIterationsExceeded { .. } => "MaxIterationsExceeded",
            MaestroError::TaskFailed(_) => "TaskFailed",
            MaestroError::Cancelled => "Cancelled",
            MaestroError::Plan(_) => "PlanError",
            MaestroError::NonDeterminism { .. } => "NonDeterminismError",
            MaestroError::NotFound(_) => "NotFound",
            MaestroError::Unauthorized(_) => "Unauthorized",
            MaestroError::Config(_) => "ConfigError",
            MaestroError::Executor(_) => "ExecutorError",
            MaestroError::Http(_) => "HttpError",
            MaestroError::Serialization(_) => "SerializationError",
            MaestroError::Io(_) => "IoError",
        }
    }

    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MaestroError::StoreUnavailable(_)
                | MaestroError::BusPublish { .. }
                | MaestroError::Conflict { .. }
        )
    }
}
