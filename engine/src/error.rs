//! Crate-wide error types.
//!
//! One `thiserror` enum per concern, converted into [`EngineError`] at the
//! boundary, mirroring how the store and tool layers each own their narrow
//! error type.

use thiserror::Error;

/// Errors from the Task Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("artifact not found: {task_id}/{artifact_id}")]
    ArtifactNotFound { task_id: String, artifact_id: String },
    #[error("store io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors from tool dispatch. Distinguished from `ToolFailure` reported
/// inline in a tool-reply message: this enum is for dispatcher-level
/// failures (tool not found), not the tool's own execution error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Top-level engine error. Every public operation returns `Result<_,
/// EngineError>`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cancelled")]
    Cancellation,
    #[error("tool failure: {0}")]
    ToolFailure(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal io error: {0}")]
    InternalIo(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::ArtifactNotFound { task_id, artifact_id } => {
                EngineError::NotFound(format!("{task_id}/{artifact_id}"))
            }
            StoreError::Io(msg) => EngineError::InternalIo(msg),
            StoreError::Serialization(msg) => EngineError::InternalIo(msg),
        }
    }
}

impl From<ToolError> for EngineError {
    fn from(e: ToolError) -> Self {
        EngineError::ToolFailure(e.to_string())
    }
}
