pub mod json_store;
pub mod memory_store;

use async_trait::async_trait;

use crate::engine::error::EngineError;
use crate::engine::types::*;

/// Optional terminal fields written alongside a status update.
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    pub report_location: Option<String>,
    pub rejection_reason: Option<String>,
    pub error: Option<serde_json::Value>,
}

/// Durable workflow state plus the callback registration/result records the
/// resumption protocol depends on. All writes are single-record,
/// last-writer-wins, and safe to repeat with identical arguments. The only
/// hard guard is terminal-status immutability.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a new workflow record. Fails with `AlreadyExists` if the
    /// identifier is taken; callers re-entering an existing workflow treat
    /// that as non-fatal.
    async fn create_workflow(&self, record: &WorkflowRecord) -> Result<(), EngineError>;

    /// Fetch a workflow record snapshot.
    async fn get_workflow(&self, workflow_id: &str)
        -> Result<Option<WorkflowRecord>, EngineError>;

    /// Update status, current step, and optional terminal fields. Moving a
    /// terminal record to a different status is an invariant violation.
    async fn update_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        current_step: Option<&str>,
        extra: Option<StatusExtra>,
    ) -> Result<(), EngineError>;

    /// Append one entry to the workflow's step history.
    async fn append_step(&self, workflow_id: &str, step: &StepRecord) -> Result<(), EngineError>;

    /// List workflows, optionally filtered by status.
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowRecord>, EngineError>;

    /// Persist a callback registration and index it by token.
    async fn put_registration(&self, reg: &CallbackRegistration) -> Result<(), EngineError>;

    /// Active registration for one suspension point, if any.
    async fn get_registration(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError>;

    /// Token-indexed lookup — never a scan over workflow records.
    async fn find_registration(
        &self,
        token: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError>;

    /// Mark a registration consumed. Consuming twice is harmless.
    async fn mark_consumed(&self, token: &str) -> Result<(), EngineError>;

    /// Persist a delivered callback, keyed by token.
    async fn put_callback(&self, record: &CallbackRecord) -> Result<(), EngineError>;

    /// Stored callback for a token, if one has been delivered.
    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRecord>, EngineError>;
}

/// Apply a status update to a record in place, enforcing the terminal
/// guard. Shared by the store implementations.
pub(crate) fn apply_status_update(
    record: &mut WorkflowRecord,
    status: WorkflowStatus,
    current_step: Option<&str>,
    extra: Option<StatusExtra>,
) -> Result<(), EngineError> {
    if record.status.is_terminal() && record.status != status {
        return Err(EngineError::Invariant(format!(
            "workflow {} is {} (terminal); refusing transition to {}",
            record.workflow_id, record.status, status
        )));
    }

    record.status = status;
    record.updated_at = chrono::Utc::now();
    if let Some(step) = current_step {
        record.current_step = step.to_string();
    }
    if let Some(extra) = extra {
        if let Some(location) = extra.report_location {
            record.report_location = Some(location);
        }
        if let Some(reason) = extra.rejection_reason {
            record.rejection_reason = Some(reason);
        }
        if let Some(error) = extra.error {
            record.error = Some(error);
        }
    }
    Ok(())
}
