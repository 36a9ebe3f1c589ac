use thiserror::Error;

/// Classified engine errors. The classification matters: validation errors
/// surface as 4xx, storage faults as retryable 5xx, timeouts and
/// task-reported failures must stay distinguishable on the workflow record,
/// and invariant violations are always fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("storage fault: {0}")]
    Storage(String),

    #[error("dispatch fault: {0}")]
    Dispatch(String),

    #[error("task failed in step '{step}': {message}")]
    Task { step: String, message: String },

    #[error("timed out awaiting callback '{step}' after {timeout_s}s")]
    Timeout { step: String, timeout_s: u64 },

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        EngineError::Storage(err.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::NotFound(_) => "NotFound",
            EngineError::AlreadyExists(_) => "AlreadyExists",
            EngineError::Storage(_) => "StorageFault",
            EngineError::Dispatch(_) => "DispatchFault",
            EngineError::Task { .. } => "TaskFault",
            EngineError::Timeout { .. } => "TimeoutFault",
            EngineError::Invariant(_) => "InvariantViolation",
        }
    }

    /// Compact representation safe to persist on the workflow record.
    pub fn sanitized(&self) -> serde_json::Value {
        serde_json::json!({
            "error_type": self.kind(),
            "error_message": self.to_string(),
        })
    }
}
