use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::{ArtifactStore as _, CALLBACK_RESULT_THRESHOLD, serialized_size};
use crate::engine::types::{
    CALLBACK_TTL_DAYS, CallbackRecord, CallbackStatus, WorkflowOutcome, WorkflowStatus,
};
use crate::storage::StateStore as _;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct StartWorkflowRequest {
    #[serde(default)]
    pub topic: Option<String>,
    /// Arbitrary caller-supplied parameters passed through to every stage.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct CallbackDelivery {
    #[serde(default)]
    pub token: Option<String>,
    /// SUCCESS or FAILURE.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /workflows
pub async fn start_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartWorkflowRequest>,
) -> Result<Json<WorkflowOutcome>, AppError> {
    let topic = req
        .topic
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("Missing required field: 'topic'".to_string()))?;
    let parameters = req.parameters.unwrap_or_else(|| serde_json::json!({}));

    let outcome = state.orchestrator.start(topic, parameters).await?;
    Ok(Json(outcome))
}

/// GET /workflows/{id}
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = state
        .orchestrator
        .store()
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workflow '{}' not found", id)))?;

    Ok(Json(serde_json::to_value(&record).map_err(|e| {
        AppError::Internal(format!("failed to serialize workflow record: {}", e))
    })?))
}

/// GET /workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListWorkflowsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status_filter = params
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let workflows = state.orchestrator.store().list_workflows(status_filter).await?;

    // Summary view; full step history stays behind GET /workflows/{id}.
    let summaries: Vec<serde_json::Value> = workflows
        .iter()
        .map(|w| {
            serde_json::json!({
                "workflow_id": w.workflow_id,
                "topic": w.topic,
                "status": w.status,
                "current_step": w.current_step,
                "created_at": w.created_at,
                "updated_at": w.updated_at,
                "steps_completed": w.steps_completed.len(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "workflows": summaries,
        "total": summaries.len(),
    })))
}

/// POST /workflows/{id}/resume
pub async fn resume_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowOutcome>, AppError> {
    let outcome = state.orchestrator.resume(&id).await?;
    Ok(Json(outcome))
}

/// POST /callbacks
///
/// Ingestion and resumption are deliberately decoupled: once the callback
/// record is durable the delivery is acknowledged, and the inline
/// re-invocation that follows is best effort. A failed resumption never
/// turns a stored delivery into an error response.
pub async fn ingest_callback(
    State(state): State<Arc<AppState>>,
    Json(delivery): Json<CallbackDelivery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = delivery
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing required field: 'token'".to_string()))?;

    let status = match delivery.status.as_deref() {
        Some("SUCCESS") => CallbackStatus::Success,
        Some("FAILURE") => CallbackStatus::Failure,
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "Invalid status '{}'. Use: SUCCESS, FAILURE",
                other
            )));
        }
        None => {
            return Err(AppError::BadRequest(
                "Missing required field: 'status'".to_string(),
            ));
        }
    };

    match status {
        CallbackStatus::Success if delivery.result.is_none() => {
            return Err(AppError::BadRequest(
                "SUCCESS callbacks require a 'result'".to_string(),
            ));
        }
        CallbackStatus::Failure if delivery.error.is_none() => {
            return Err(AppError::BadRequest(
                "FAILURE callbacks require an 'error'".to_string(),
            ));
        }
        _ => {}
    }

    let registration = state
        .orchestrator
        .tokens()
        .resolve(token)
        .await?
        .ok_or_else(|| AppError::NotFound("Unknown callback token".to_string()))?;

    if registration.consumed {
        // A re-delivered callback for an already-consumed token is a
        // duplicate, not an error, as long as the original record is there.
        if state.orchestrator.store().get_callback(token).await?.is_some() {
            return Ok(Json(serde_json::json!({
                "accepted": true,
                "duplicate": true,
                "workflow_id": registration.workflow_id,
            })));
        }
        return Err(AppError::Conflict(
            "Callback token already consumed".to_string(),
        ));
    }

    if registration.is_expired(Utc::now()) {
        return Err(AppError::NotFound("Callback token expired".to_string()));
    }

    // A live registration can outlast its workflow (a dispatch fault fails
    // the workflow with the token still unconsumed). Terminal workflows no
    // longer await anything.
    match state
        .orchestrator
        .store()
        .get_workflow(&registration.workflow_id)
        .await?
    {
        Some(workflow) if workflow.status.is_terminal() => {
            return Err(AppError::Conflict(format!(
                "Workflow '{}' is {} and no longer awaits callbacks",
                registration.workflow_id, workflow.status
            )));
        }
        Some(_) => {}
        None => {
            return Err(AppError::NotFound(format!(
                "Workflow '{}' not found",
                registration.workflow_id
            )));
        }
    }

    // Oversized results are offloaded before the record is persisted, so
    // the stored callback stays bounded.
    let result = match delivery.result {
        Some(value) if serialized_size(&value) > CALLBACK_RESULT_THRESHOLD => {
            let reference = state
                .orchestrator
                .artifacts()
                .store(
                    &format!("callbacks/{}/result.json", token),
                    &value,
                    "application/json",
                )
                .await?;
            Some(reference.to_value())
        }
        other => other,
    };

    let now = Utc::now();
    let record = CallbackRecord {
        token: token.to_string(),
        status,
        result,
        error: delivery.error,
        received_at: now,
        ttl: now + Duration::days(CALLBACK_TTL_DAYS),
    };
    state.orchestrator.store().put_callback(&record).await?;

    info!(
        workflow_id = %registration.workflow_id,
        step_name = %registration.step_name,
        status = ?record.status,
        "callback ingested"
    );

    if let Err(e) = state.orchestrator.resume(&registration.workflow_id).await {
        warn!(
            workflow_id = %registration.workflow_id,
            error = %e,
            "post-callback resumption failed; delivery remains accepted"
        );
    }

    Ok(Json(serde_json::json!({
        "accepted": true,
        "workflow_id": registration.workflow_id,
        "step_name": registration.step_name,
    })))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn parse_status(s: &str) -> Result<WorkflowStatus, String> {
    match s {
        "INITIALIZING" => Ok(WorkflowStatus::Initializing),
        "RUNNING" => Ok(WorkflowStatus::Running),
        "AWAITING_APPROVAL" => Ok(WorkflowStatus::AwaitingApproval),
        "PENDING" => Ok(WorkflowStatus::Pending),
        "COMPLETED" => Ok(WorkflowStatus::Completed),
        "REJECTED" => Ok(WorkflowStatus::Rejected),
        "FAILED" => Ok(WorkflowStatus::Failed),
        _ => Err(format!(
            "Invalid status '{}'. Use: INITIALIZING, RUNNING, AWAITING_APPROVAL, PENDING, COMPLETED, REJECTED, FAILED",
            s
        )),
    }
}
