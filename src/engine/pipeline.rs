use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, TASK_PAYLOAD_THRESHOLD, serialized_size};
use crate::dispatch::AgentDispatcher;
use crate::engine::context::{DurableContext, Wait};
use crate::engine::error::EngineError;
use crate::engine::types::*;
use crate::storage::{StateStore, StatusExtra};
use crate::tokens::TokenRegistry;

/// Stage timeouts and endpoints. Defaults mirror the pipeline's expected
/// agent runtimes: research is the long pole, approval waits a day.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub callback_base_url: String,
    pub researcher_url: String,
    pub analyst_url: String,
    pub writer_url: String,
    pub research_timeout_s: u64,
    pub analysis_timeout_s: u64,
    pub writing_timeout_s: u64,
    pub approval_timeout_s: u64,
    pub review_url_ttl_s: u64,
    pub report_url_ttl_s: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://127.0.0.1:8080".to_string(),
            researcher_url: "http://127.0.0.1:9001/tasks".to_string(),
            analyst_url: "http://127.0.0.1:9002/tasks".to_string(),
            writer_url: "http://127.0.0.1:9003/tasks".to_string(),
            research_timeout_s: 4 * 3600,
            analysis_timeout_s: 2 * 3600,
            writing_timeout_s: 3600,
            approval_timeout_s: 24 * 3600,
            review_url_ttl_s: 86_400,
            report_url_ttl_s: 604_800,
        }
    }
}

/// Outcome of one stage boundary: either a value to carry forward, or a
/// suspension the invocation must propagate all the way out.
#[derive(Debug)]
pub enum StageOutcome {
    Completed(serde_json::Value),
    Suspended(CallbackConfig),
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub swept: usize,
    pub timed_out: usize,
}

/// A RUNNING record untouched for this long is treated as stranded by a
/// crashed invocation and re-invoked by the sweep.
const STUCK_RUNNING_GRACE_S: i64 = 600;

/// The orchestration engine. Holds the injected stores and dispatcher —
/// constructed once by the hosting entry point and passed down, never
/// reached for as ambient globals.
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatcher: Arc<dyn AgentDispatcher>,
    tokens: TokenRegistry,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        artifacts: Arc<dyn ArtifactStore>,
        dispatcher: Arc<dyn AgentDispatcher>,
        config: PipelineConfig,
    ) -> Self {
        let tokens = TokenRegistry::new(store.clone(), config.callback_base_url.clone());
        Self {
            store,
            artifacts,
            dispatcher,
            tokens,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    /// Start a new workflow and run it to its first suspension point (or
    /// to completion, if every stage happens to respond synchronously).
    pub async fn start(
        &self,
        topic: &str,
        parameters: serde_json::Value,
    ) -> Result<WorkflowOutcome, EngineError> {
        if topic.trim().is_empty() {
            return Err(EngineError::Validation(
                "missing required field: 'topic'".to_string(),
            ));
        }

        let workflow_id = Uuid::new_v4().to_string();
        info!(workflow_id = %workflow_id, topic = %topic, "workflow starting");

        let mut ctx = self
            .load_or_create_context(&workflow_id, Some((topic, parameters)))
            .await?;
        self.run_state_machine(&mut ctx).await
    }

    /// Re-invoke an existing workflow: replay from the top, short-circuit
    /// completed steps, halt again at the first still-pending suspension.
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowOutcome, EngineError> {
        let mut ctx = self.load_or_create_context(workflow_id, None).await?;
        self.run_state_machine(&mut ctx).await
    }

    /// Reconstruct the durable context from the state store. With `start`
    /// present a missing record is created; `AlreadyExists` from a racing
    /// creation is treated as re-entry, not as a failure.
    pub async fn load_or_create_context(
        &self,
        workflow_id: &str,
        start: Option<(&str, serde_json::Value)>,
    ) -> Result<DurableContext, EngineError> {
        let record = match self.store.get_workflow(workflow_id).await? {
            Some(record) => record,
            None => match start {
                Some((topic, parameters)) => {
                    let record = WorkflowRecord::new(workflow_id, topic, parameters);
                    match self.store.create_workflow(&record).await {
                        Ok(()) => record,
                        Err(EngineError::AlreadyExists(_)) => self
                            .store
                            .get_workflow(workflow_id)
                            .await?
                            .ok_or_else(|| {
                                EngineError::Storage(format!(
                                    "workflow {} vanished after concurrent create",
                                    workflow_id
                                ))
                            })?,
                        Err(e) => return Err(e),
                    }
                }
                None => return Err(EngineError::NotFound(workflow_id.to_string())),
            },
        };

        Ok(DurableContext::new(
            record,
            self.store.clone(),
            self.artifacts.clone(),
            self.tokens.clone(),
        ))
    }

    /// Run the state machine. On an unrecovered error, one best-effort
    /// FAILED update is attempted; a failure during that update is logged
    /// and never masks the original error.
    pub async fn run_state_machine(
        &self,
        ctx: &mut DurableContext,
    ) -> Result<WorkflowOutcome, EngineError> {
        let workflow_id = ctx.workflow_id().to_string();

        match self.run_stages(ctx).await {
            Ok(outcome) => {
                info!(
                    workflow_id = %workflow_id,
                    status = %outcome.status,
                    "invocation finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    workflow_id = %workflow_id,
                    kind = e.kind(),
                    error = %e,
                    "workflow failed"
                );

                if !ctx.record.status.is_terminal() {
                    let extra = StatusExtra {
                        error: Some(e.sanitized()),
                        ..Default::default()
                    };
                    match self
                        .store
                        .update_status(&workflow_id, WorkflowStatus::Failed, Some("error"), Some(extra))
                        .await
                    {
                        Ok(()) => ctx.refresh_status(WorkflowStatus::Failed, "error"),
                        Err(update_err) => warn!(
                            workflow_id = %workflow_id,
                            error = %update_err,
                            "failed to record FAILED status"
                        ),
                    }
                }

                Err(e)
            }
        }
    }

    /// Re-invoke every suspended workflow so expired suspension points are
    /// observed and converted to FAILED. Driven by the serve loop or the
    /// `sweep` CLI command.
    pub async fn sweep(&self) -> Result<SweepSummary, EngineError> {
        let mut candidates = self
            .store
            .list_workflows(Some(WorkflowStatus::Pending))
            .await?;
        candidates.extend(
            self.store
                .list_workflows(Some(WorkflowStatus::AwaitingApproval))
                .await?,
        );

        // Workflows stranded RUNNING by a crash between two status writes
        // have no suspension to deliver against; retry them after a grace
        // period. Replay makes the retry safe for every checkpointed step.
        let stale_cutoff = chrono::Utc::now() - chrono::Duration::seconds(STUCK_RUNNING_GRACE_S);
        candidates.extend(
            self.store
                .list_workflows(Some(WorkflowStatus::Running))
                .await?
                .into_iter()
                .filter(|r| r.updated_at < stale_cutoff),
        );

        let mut swept = 0usize;
        let mut timed_out = 0usize;

        for record in candidates {
            swept += 1;
            match self.resume(&record.workflow_id).await {
                Ok(_) => {}
                Err(EngineError::Timeout { .. }) => timed_out += 1,
                Err(e) => warn!(
                    workflow_id = %record.workflow_id,
                    error = %e,
                    "sweep re-invocation failed"
                ),
            }
        }

        info!(swept, timed_out, "sweep complete");
        Ok(SweepSummary { swept, timed_out })
    }

    async fn run_stages(
        &self,
        ctx: &mut DurableContext,
    ) -> Result<WorkflowOutcome, EngineError> {
        if ctx.record.status.is_terminal() {
            return Ok(Self::terminal_outcome(&ctx.record));
        }

        let workflow_id = ctx.workflow_id().to_string();
        let topic = ctx.record.topic.clone();
        let parameters = ctx.record.parameters.clone();

        // INITIALIZING → RUNNING
        {
            let store = self.store.clone();
            let wf = workflow_id.clone();
            ctx.run_once("init_workflow", move || async move {
                store
                    .update_status(&wf, WorkflowStatus::Running, Some("research_phase"), None)
                    .await?;
                Ok(serde_json::json!({ "initialized": true }))
            })
            .await?;
            if ctx.record.status == WorkflowStatus::Initializing {
                ctx.refresh_status(WorkflowStatus::Running, "research_phase");
            }
        }

        // Research stage
        let research = match self
            .dispatch_and_await(
                ctx,
                "research_phase",
                &self.config.researcher_url,
                serde_json::json!({ "topic": topic.clone(), "parameters": parameters.clone() }),
                self.config.research_timeout_s,
            )
            .await?
        {
            StageOutcome::Completed(value) => value,
            StageOutcome::Suspended(config) => {
                return Ok(WorkflowOutcome::suspended(
                    &workflow_id,
                    WorkflowStatus::Pending,
                    "research_completion",
                    config.callback_url,
                ));
            }
        };

        // Analysis stage
        let analysis = match self
            .dispatch_and_await(
                ctx,
                "analysis_phase",
                &self.config.analyst_url,
                serde_json::json!({ "research_data": research, "topic": topic.clone() }),
                self.config.analysis_timeout_s,
            )
            .await?
        {
            StageOutcome::Completed(value) => value,
            StageOutcome::Suspended(config) => {
                return Ok(WorkflowOutcome::suspended(
                    &workflow_id,
                    WorkflowStatus::Pending,
                    "analysis_completion",
                    config.callback_url,
                ));
            }
        };

        // Human approval gate
        {
            let store = self.store.clone();
            let artifacts = self.artifacts.clone();
            let wf = workflow_id.clone();
            let analysis = analysis.clone();
            let review_ttl = self.config.review_url_ttl_s;
            ctx.run_once("request_approval", move || async move {
                store
                    .update_status(
                        &wf,
                        WorkflowStatus::AwaitingApproval,
                        Some("human_approval"),
                        None,
                    )
                    .await?;

                let review_url = if serialized_size(&analysis) > TASK_PAYLOAD_THRESHOLD {
                    let reference = artifacts
                        .store(
                            &format!("approvals/{}/analysis_results.json", wf),
                            &analysis,
                            "application/json",
                        )
                        .await?;
                    Some(artifacts.presigned_read_url(&reference.uri, review_ttl).await?)
                } else {
                    None
                };

                let analysis_summary = analysis
                    .get("summary")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!("No summary available"));

                Ok(serde_json::json!({
                    "workflow_id": wf,
                    "status": "approval_required",
                    "analysis_summary": analysis_summary,
                    "review_url": review_url,
                    "requested_at": chrono::Utc::now().to_rfc3339(),
                }))
            })
            .await?;
            ctx.refresh_status(WorkflowStatus::AwaitingApproval, "human_approval");
        }

        let approval = match ctx
            .await_callback("human_approval", self.config.approval_timeout_s)
            .await?
        {
            Wait::Ready(value) => value,
            Wait::Pending(config) => {
                return Ok(WorkflowOutcome::suspended(
                    &workflow_id,
                    WorkflowStatus::AwaitingApproval,
                    "human_approval",
                    config.callback_url,
                ));
            }
        };

        let approved = approval
            .get("approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !approved {
            let reason = approval
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("No reason provided")
                .to_string();

            let store = self.store.clone();
            let wf = workflow_id.clone();
            let recorded_reason = reason.clone();
            ctx.run_once("mark_rejected", move || async move {
                store
                    .update_status(
                        &wf,
                        WorkflowStatus::Rejected,
                        Some("completed"),
                        Some(StatusExtra {
                            rejection_reason: Some(recorded_reason),
                            ..Default::default()
                        }),
                    )
                    .await?;
                Ok(serde_json::json!({ "rejected": true }))
            })
            .await?;
            ctx.refresh_status(WorkflowStatus::Rejected, "completed");

            return Ok(WorkflowOutcome {
                workflow_id,
                status: WorkflowStatus::Rejected,
                awaiting: None,
                callback_url: None,
                report_url: None,
                reason: Some(reason),
                message: None,
            });
        }

        let feedback = approval
            .get("feedback")
            .cloned()
            .unwrap_or_else(|| serde_json::json!(""));

        // Writing stage, carrying reviewer feedback
        let report = match self
            .dispatch_and_await(
                ctx,
                "writing_phase",
                &self.config.writer_url,
                serde_json::json!({
                    "analysis": analysis,
                    "feedback": feedback,
                    "topic": topic,
                    "parameters": parameters,
                }),
                self.config.writing_timeout_s,
            )
            .await?
        {
            StageOutcome::Completed(value) => value,
            StageOutcome::Suspended(config) => {
                return Ok(WorkflowOutcome::suspended(
                    &workflow_id,
                    WorkflowStatus::Pending,
                    "report_generation",
                    config.callback_url,
                ));
            }
        };

        // Finalize: store the report, mint the long-lived read URL
        let finalized = {
            let store = self.store.clone();
            let artifacts = self.artifacts.clone();
            let wf = workflow_id.clone();
            let report_ttl = self.config.report_url_ttl_s;
            ctx.run_once("finalize_workflow", move || async move {
                let key = format!("reports/{}/final_report.json", wf);
                let reference = artifacts.store(&key, &report, "application/json").await?;
                let report_url = artifacts
                    .presigned_read_url(&reference.uri, report_ttl)
                    .await?;

                store
                    .update_status(
                        &wf,
                        WorkflowStatus::Completed,
                        Some("completed"),
                        Some(StatusExtra {
                            report_location: Some(reference.uri.clone()),
                            ..Default::default()
                        }),
                    )
                    .await?;

                Ok(serde_json::json!({
                    "report_url": report_url,
                    "report_location": reference.uri,
                }))
            })
            .await?
        };
        ctx.refresh_status(WorkflowStatus::Completed, "completed");

        Ok(WorkflowOutcome {
            workflow_id,
            status: WorkflowStatus::Completed,
            awaiting: None,
            callback_url: None,
            report_url: finalized
                .get("report_url")
                .and_then(|v| v.as_str())
                .map(String::from),
            reason: None,
            message: Some("workflow completed".to_string()),
        })
    }

    /// The reusable dispatch+await sub-protocol: issue-or-reuse callback
    /// config, checkpointed dispatch with the config embedded in the
    /// outbound payload (offloaded above the size threshold), suspension
    /// point, rehydration, stage completion summary.
    async fn dispatch_and_await(
        &self,
        ctx: &mut DurableContext,
        stage: &str,
        endpoint: &str,
        payload: serde_json::Value,
        timeout_s: u64,
    ) -> Result<StageOutcome, EngineError> {
        let workflow_id = ctx.workflow_id().to_string();
        let dispatch_step = format!("{}_dispatch", stage);
        let await_step = format!("{}_await", stage);

        // The token is only needed while the suspension is still live.
        let config = if ctx.record.completed_step(&await_step).is_none() {
            Some(
                self.tokens
                    .issue_or_reuse(&workflow_id, &await_step, timeout_s)
                    .await?,
            )
        } else {
            None
        };

        {
            let store = self.store.clone();
            let artifacts = self.artifacts.clone();
            let dispatcher = self.dispatcher.clone();
            let endpoint = endpoint.to_string();
            let stage_name = stage.to_string();
            let wf = workflow_id.clone();
            let config = config.clone();
            ctx.run_once(&dispatch_step, move || async move {
                let config = config.ok_or_else(|| {
                    EngineError::Invariant(format!(
                        "dispatch for '{}' executed without a live callback registration",
                        stage_name
                    ))
                })?;

                store
                    .update_status(&wf, WorkflowStatus::Running, Some(&stage_name), None)
                    .await?;

                let payload_value = if serialized_size(&payload) > TASK_PAYLOAD_THRESHOLD {
                    let reference = artifacts
                        .store(
                            &format!("tasks/{}/{}_payload.json", wf, stage_name),
                            &payload,
                            "application/json",
                        )
                        .await?;
                    reference.to_value()
                } else {
                    payload
                };

                let outbound = serde_json::json!({
                    "payload": payload_value,
                    "workflow_id": wf,
                    "callback_url": config.callback_url,
                    "callback_token": config.token,
                });
                dispatcher.dispatch(&endpoint, &outbound).await?;

                Ok(serde_json::json!({ "dispatched": true, "endpoint": endpoint }))
            })
            .await?;
        }

        match ctx.await_callback(&await_step, timeout_s).await? {
            Wait::Pending(config) => {
                ctx.set_status(WorkflowStatus::Pending, stage, None).await?;
                Ok(StageOutcome::Suspended(config))
            }
            Wait::Ready(value) => {
                let value = ctx
                    .rehydrate(&format!("{}_rehydrate", stage), value)
                    .await?;
                if ctx.record.completed_step(stage).is_none() {
                    ctx.checkpoint(
                        stage,
                        serde_json::json!({
                            "status": "completed",
                            "has_result": !value.is_null(),
                        }),
                    )
                    .await?;
                }
                Ok(StageOutcome::Completed(value))
            }
        }
    }

    fn terminal_outcome(record: &WorkflowRecord) -> WorkflowOutcome {
        WorkflowOutcome {
            workflow_id: record.workflow_id.clone(),
            status: record.status,
            awaiting: None,
            callback_url: None,
            report_url: None,
            reason: record.rejection_reason.clone(),
            message: Some(format!("workflow already {}", record.status)),
        }
    }
}
