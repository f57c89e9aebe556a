use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine facade and step runner.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition failed validation at registration or build time.
    #[error("invalid workflow definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },

    /// No definition registered under this ID.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No instance persisted under this ID.
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// A required step exhausted its attempts. `error` carries the raw
    /// executor failure message.
    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    /// A scheduling wave finished without any step reaching a terminal
    /// status; the workflow cannot advance.
    #[error("workflow made no progress; no step reached a terminal status")]
    NoProgress,

    /// Task-level runtime failure (join errors and the like).
    #[error("execution error: {0}")]
    Execution(String),

    /// A store operation failed; the current engine operation cannot
    /// safely continue.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found")]
    NotFound,

    #[error("query error: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
