use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::artifacts::{ArtifactRef, ArtifactStore, TASK_PAYLOAD_THRESHOLD, serialized_size};
use crate::engine::error::EngineError;
use crate::engine::types::*;
use crate::storage::{StateStore, StatusExtra};
use crate::tokens::TokenRegistry;

/// Result of entering a suspension point.
#[derive(Debug)]
pub enum Wait {
    /// The awaited callback has been delivered; here is its result.
    Ready(serde_json::Value),
    /// Nothing delivered yet — halt the invocation and hand this config to
    /// whoever needs to call back.
    Pending(CallbackConfig),
}

/// Durable execution context for one workflow. Reconstructed from the
/// state store on every invocation; nothing here survives between
/// invocations except through the stores, so every primitive persists
/// before returning control.
pub struct DurableContext {
    pub record: WorkflowRecord,
    store: Arc<dyn StateStore>,
    artifacts: Arc<dyn ArtifactStore>,
    tokens: TokenRegistry,
}

impl DurableContext {
    pub fn new(
        record: WorkflowRecord,
        store: Arc<dyn StateStore>,
        artifacts: Arc<dyn ArtifactStore>,
        tokens: TokenRegistry,
    ) -> Self {
        Self {
            record,
            store,
            artifacts,
            tokens,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.record.workflow_id
    }

    /// Execute a checkpointed step. If the step already appears in the
    /// workflow's history the recorded result is returned and `f` is never
    /// invoked — this is what makes re-invocation from the top safe. A
    /// failing step is recorded with a sanitized error and the error
    /// propagates to the state machine.
    pub async fn run_once<F, Fut>(
        &mut self,
        step_name: &str,
        f: F,
    ) -> Result<serde_json::Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, EngineError>>,
    {
        if let Some(done) = self.record.completed_step(step_name) {
            info!(
                workflow_id = %self.record.workflow_id,
                step_name = %step_name,
                "step replayed from checkpoint"
            );
            return Ok(done.result_summary.clone().unwrap_or(serde_json::Value::Null));
        }

        info!(
            workflow_id = %self.record.workflow_id,
            step_name = %step_name,
            "step starting"
        );

        match f().await {
            Ok(result) => {
                let summary = self.summarize(step_name, &result).await?;
                self.checkpoint(step_name, summary).await?;
                info!(
                    workflow_id = %self.record.workflow_id,
                    step_name = %step_name,
                    "step completed"
                );
                Ok(result)
            }
            Err(e) => {
                let failed = StepRecord::failed(step_name, e.sanitized());
                // Best effort: the original error must not be masked by a
                // failure to record it.
                if let Err(record_err) = self.store.append_step(&self.record.workflow_id, &failed).await
                {
                    warn!(
                        workflow_id = %self.record.workflow_id,
                        step_name = %step_name,
                        error = %record_err,
                        "failed to record step failure"
                    );
                } else {
                    self.record.steps_completed.push(failed);
                }
                Err(e)
            }
        }
    }

    /// Suspension point. On first entry a callback registration is created
    /// and `Pending` is returned so the caller halts the invocation. A
    /// later invocation finds the stored callback bound to that
    /// registration's token, consumes it exactly once, and checkpoints the
    /// result so further replays short-circuit.
    pub async fn await_callback(
        &mut self,
        step_name: &str,
        timeout_s: u64,
    ) -> Result<Wait, EngineError> {
        if let Some(done) = self.record.completed_step(step_name) {
            return Ok(Wait::Ready(
                done.result_summary.clone().unwrap_or(serde_json::Value::Null),
            ));
        }

        let workflow_id = self.record.workflow_id.clone();

        let registration = match self.store.get_registration(&workflow_id, step_name).await? {
            Some(reg) => reg,
            None => {
                let config = self
                    .tokens
                    .issue_or_reuse(&workflow_id, step_name, timeout_s)
                    .await?;
                info!(
                    workflow_id = %workflow_id,
                    step_name = %step_name,
                    "suspension point registered"
                );
                return Ok(Wait::Pending(config));
            }
        };

        if let Some(callback) = self.store.get_callback(&registration.token).await? {
            return match callback.status {
                CallbackStatus::Failure => {
                    self.tokens.consume(&registration.token).await?;
                    Err(EngineError::Task {
                        step: step_name.to_string(),
                        message: callback
                            .error
                            .unwrap_or_else(|| "task reported failure without detail".to_string()),
                    })
                }
                CallbackStatus::Success => {
                    let result = callback.result.unwrap_or(serde_json::json!({}));
                    self.checkpoint(step_name, result.clone()).await?;
                    self.tokens.consume(&registration.token).await?;
                    info!(
                        workflow_id = %workflow_id,
                        step_name = %step_name,
                        "callback consumed"
                    );
                    Ok(Wait::Ready(result))
                }
            };
        }

        if registration.consumed {
            // Consumed but neither checkpointed nor re-deliverable: stale
            // data would be the only thing left to return. Fail loudly.
            return Err(EngineError::Invariant(format!(
                "suspension point '{}' of workflow {} already consumed with no stored result",
                step_name, workflow_id
            )));
        }

        if registration.is_expired(Utc::now()) {
            return Err(EngineError::Timeout {
                step: step_name.to_string(),
                timeout_s: registration.timeout_s,
            });
        }

        Ok(Wait::Pending(self.tokens.config_for(&registration)))
    }

    /// Rehydrate an offloaded value. Non-references pass through untouched.
    /// The checkpoint records the reference, never the bytes, so replay
    /// re-fetches — artifact reads are side-effect free.
    pub async fn rehydrate(
        &mut self,
        step_name: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let Some(reference) = ArtifactRef::from_value(&value) else {
            return Ok(value);
        };

        let content = self.artifacts.fetch(&reference.uri).await?;

        if self.record.completed_step(step_name).is_none() {
            self.checkpoint(step_name, reference.to_value()).await?;
        }

        info!(
            workflow_id = %self.record.workflow_id,
            step_name = %step_name,
            uri = %reference.uri,
            size_bytes = reference.size_bytes,
            "artifact rehydrated"
        );

        Ok(content)
    }

    /// Append a successful step record, durably and locally.
    pub async fn checkpoint(
        &mut self,
        step_name: &str,
        summary: serde_json::Value,
    ) -> Result<(), EngineError> {
        let step = StepRecord::success(step_name, summary);
        self.store.append_step(&self.record.workflow_id, &step).await?;
        self.record.steps_completed.push(step);
        Ok(())
    }

    /// Persist a status transition and mirror it on the local snapshot.
    pub async fn set_status(
        &mut self,
        status: WorkflowStatus,
        current_step: &str,
        extra: Option<StatusExtra>,
    ) -> Result<(), EngineError> {
        self.store
            .update_status(&self.record.workflow_id, status, Some(current_step), extra)
            .await?;
        self.record.status = status;
        self.record.current_step = current_step.to_string();
        Ok(())
    }

    /// Mirror a status change some checkpointed closure already persisted.
    pub fn refresh_status(&mut self, status: WorkflowStatus, current_step: &str) {
        self.record.status = status;
        self.record.current_step = current_step.to_string();
    }

    /// Keep the recorded summary bounded: oversized results are offloaded
    /// and the checkpoint holds the reference instead.
    async fn summarize(
        &self,
        step_name: &str,
        result: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        if serialized_size(result) <= TASK_PAYLOAD_THRESHOLD {
            return Ok(result.clone());
        }
        let key = format!("steps/{}/{}.json", self.record.workflow_id, step_name);
        let reference = self
            .artifacts
            .store(&key, result, "application/json")
            .await?;
        Ok(reference.to_value())
    }
}
