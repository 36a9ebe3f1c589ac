//! Tests for the REST API, centered on the callback ingress rules.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use anchorflow::api::{AppState, router};
use anchorflow::artifacts::is_reference;
use anchorflow::artifacts::local_store::LocalArtifactStore;
use anchorflow::dispatch::AgentDispatcher;
use anchorflow::engine::error::EngineError;
use anchorflow::engine::pipeline::{Orchestrator, PipelineConfig};
use anchorflow::engine::types::*;
use anchorflow::storage::{StateStore, StatusExtra};
use anchorflow::storage::memory_store::MemoryStateStore;

#[derive(Default)]
struct MockDispatcher {
    calls: Mutex<usize>,
}

#[async_trait]
impl AgentDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        _endpoint: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        *self.calls.lock().unwrap() += 1;
        Ok(serde_json::json!({"accepted": true}))
    }
}

/// Delegates to an inner store but fails every callback write, to
/// exercise the ingress storage-fault path.
struct CallbackWriteFailStore {
    inner: Arc<MemoryStateStore>,
}

#[async_trait]
impl StateStore for CallbackWriteFailStore {
    async fn create_workflow(&self, record: &WorkflowRecord) -> Result<(), EngineError> {
        self.inner.create_workflow(record).await
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, EngineError> {
        self.inner.get_workflow(workflow_id).await
    }

    async fn update_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        current_step: Option<&str>,
        extra: Option<StatusExtra>,
    ) -> Result<(), EngineError> {
        self.inner
            .update_status(workflow_id, status, current_step, extra)
            .await
    }

    async fn append_step(&self, workflow_id: &str, step: &StepRecord) -> Result<(), EngineError> {
        self.inner.append_step(workflow_id, step).await
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowRecord>, EngineError> {
        self.inner.list_workflows(status).await
    }

    async fn put_registration(&self, reg: &CallbackRegistration) -> Result<(), EngineError> {
        self.inner.put_registration(reg).await
    }

    async fn get_registration(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        self.inner.get_registration(workflow_id, step_name).await
    }

    async fn find_registration(
        &self,
        token: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        self.inner.find_registration(token).await
    }

    async fn mark_consumed(&self, token: &str) -> Result<(), EngineError> {
        self.inner.mark_consumed(token).await
    }

    async fn put_callback(&self, _record: &CallbackRecord) -> Result<(), EngineError> {
        Err(EngineError::Storage("state store unavailable".to_string()))
    }

    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRecord>, EngineError> {
        self.inner.get_callback(token).await
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryStateStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(LocalArtifactStore::new(dir.path())),
            Arc::new(MockDispatcher::default()),
            PipelineConfig {
                callback_base_url: "http://localhost:8080".to_string(),
                ..PipelineConfig::default()
            },
        ));
        let state = Arc::new(AppState { orchestrator });
        Self {
            app: router(state, 1_048_576),
            store,
            _dir: dir,
        }
    }

    async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(req).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(req).await
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    async fn start_workflow(&self) -> String {
        let (status, body) = self
            .post_json("/workflows", serde_json::json!({"topic": "api test topic"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        body["workflow_id"].as_str().unwrap().to_string()
    }

    async fn token_for(&self, workflow_id: &str, step_name: &str) -> String {
        self.store
            .get_registration(workflow_id, step_name)
            .await
            .unwrap()
            .unwrap()
            .token
    }
}

// ===== Basics =====

#[tokio::test]
async fn health_reports_ok() {
    let h = Harness::new();
    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn start_workflow_suspends_pending() {
    let h = Harness::new();
    let (status, body) = h
        .post_json("/workflows", serde_json::json!({"topic": "rust in fintech"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["awaiting"], "research_completion");
    assert_eq!(body["callback_url"], "http://localhost:8080/callbacks");
}

#[tokio::test]
async fn start_workflow_without_topic_is_bad_request() {
    let h = Harness::new();
    let (status, body) = h.post_json("/workflows", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("topic"));
}

#[tokio::test]
async fn get_workflow_roundtrip_and_404() {
    let h = Harness::new();
    let wf = h.start_workflow().await;

    let (status, body) = h.get(&format!("/workflows/{}", wf)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflow_id"], wf.as_str());
    assert_eq!(body["status"], "PENDING");
    assert!(body["steps_completed"].as_array().unwrap().len() >= 2);

    let (status, _) = h.get("/workflows/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_workflows_filters_and_rejects_bad_status() {
    let h = Harness::new();
    h.start_workflow().await;

    let (status, body) = h.get("/workflows?status=PENDING").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    let (status, body) = h.get("/workflows?status=COMPLETED").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);

    let (status, _) = h.get("/workflows?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ===== Callback ingress validation =====

#[tokio::test]
async fn callback_without_token_is_bad_request() {
    let h = Harness::new();
    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"status": "SUCCESS", "result": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_with_invalid_status_is_bad_request() {
    let h = Harness::new();
    let (status, body) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"token": "t", "status": "DONE", "result": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("DONE"));
}

#[tokio::test]
async fn success_callback_requires_result() {
    let h = Harness::new();
    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"token": "t", "status": "SUCCESS"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn failure_callback_requires_error() {
    let h = Harness::new();
    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"token": "t", "status": "FAILURE"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_with_unknown_token_is_not_found() {
    let h = Harness::new();
    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"token": "nope", "status": "SUCCESS", "result": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_with_expired_token_is_not_found() {
    let h = Harness::new();
    let wf = h.start_workflow().await;

    let mut reg = h
        .store
        .get_registration(&wf, "research_phase_await")
        .await
        .unwrap()
        .unwrap();
    reg.issued_at = Utc::now() - Duration::seconds(reg.timeout_s as i64 + 60);
    h.store.put_registration(&reg).await.unwrap();

    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"token": reg.token, "status": "SUCCESS", "result": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ===== Callback ingress behavior =====

#[tokio::test]
async fn callback_advances_workflow_inline() {
    let h = Harness::new();
    let wf = h.start_workflow().await;
    let token = h.token_for(&wf, "research_phase_await").await;

    let (status, body) = h
        .post_json(
            "/callbacks",
            serde_json::json!({
                "token": token,
                "status": "SUCCESS",
                "result": {"findings": ["f1"]},
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["workflow_id"], wf.as_str());

    // The inline re-invocation carried the workflow to the next stage.
    let record = h.store.get_workflow(&wf).await.unwrap().unwrap();
    assert_eq!(record.current_step, "analysis_phase");
    assert!(record.completed_step("research_phase_await").is_some());
}

#[tokio::test]
async fn redelivered_callback_is_acknowledged_as_duplicate() {
    let h = Harness::new();
    let wf = h.start_workflow().await;
    let token = h.token_for(&wf, "research_phase_await").await;

    let delivery = serde_json::json!({
        "token": token,
        "status": "SUCCESS",
        "result": {"findings": []},
    });

    let (status, _) = h.post_json("/callbacks", delivery.clone()).await;
    assert_eq!(status, StatusCode::OK);

    // The first delivery was consumed by the inline resume; a retry from
    // the agent is acknowledged without re-processing.
    let (status, body) = h.post_json("/callbacks", delivery).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
}

#[tokio::test]
async fn consumed_token_without_record_is_conflict() {
    let h = Harness::new();

    let now = Utc::now();
    h.store
        .put_registration(&CallbackRegistration {
            workflow_id: "wf-x".to_string(),
            step_name: "human_approval".to_string(),
            token: "tok-consumed".to_string(),
            issued_at: now,
            timeout_s: 86_400,
            consumed: true,
        })
        .await
        .unwrap();

    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({"token": "tok-consumed", "status": "SUCCESS", "result": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn callback_for_terminal_workflow_is_rejected() {
    let h = Harness::new();
    let wf = h.start_workflow().await;
    let token = h.token_for(&wf, "research_phase_await").await;

    // A dispatch fault elsewhere can fail the workflow while the
    // registration stays live and unconsumed.
    h.store
        .update_status(&wf, WorkflowStatus::Failed, Some("error"), None)
        .await
        .unwrap();

    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({
                "token": token,
                "status": "SUCCESS",
                "result": {"findings": []},
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Nothing was persisted for the dead workflow.
    assert!(h.store.get_callback(&token).await.unwrap().is_none());
    let record = h.store.get_workflow(&wf).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowStatus::Failed);
    assert!(record.completed_step("research_phase_await").is_none());
}

#[tokio::test]
async fn storage_fault_persisting_callback_is_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    let inner = Arc::new(MemoryStateStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(CallbackWriteFailStore {
            inner: inner.clone(),
        }),
        Arc::new(LocalArtifactStore::new(dir.path())),
        Arc::new(MockDispatcher::default()),
        PipelineConfig {
            callback_base_url: "http://localhost:8080".to_string(),
            ..PipelineConfig::default()
        },
    ));
    let started = orchestrator
        .start("topic", serde_json::json!({}))
        .await
        .unwrap();
    let token = inner
        .get_registration(&started.workflow_id, "research_phase_await")
        .await
        .unwrap()
        .unwrap()
        .token;

    let state = Arc::new(AppState { orchestrator });
    let app = router(state, 1_048_576);
    let req = Request::builder()
        .method("POST")
        .uri("/callbacks")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "token": token,
                "status": "SUCCESS",
                "result": {"findings": []},
            })
            .to_string(),
        ))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "Internal server error");

    // The delivery never became durable and the workflow did not advance.
    assert!(inner.get_callback(&token).await.unwrap().is_none());
    let record = inner
        .get_workflow(&started.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, WorkflowStatus::Pending);
}

#[tokio::test]
async fn oversized_callback_result_is_offloaded_before_storage() {
    let h = Harness::new();
    let wf = h.start_workflow().await;
    let token = h.token_for(&wf, "research_phase_await").await;

    let big = "x".repeat(300_000);
    let (status, _) = h
        .post_json(
            "/callbacks",
            serde_json::json!({
                "token": token,
                "status": "SUCCESS",
                "result": {"corpus": big},
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let stored = h.store.get_callback(&token).await.unwrap().unwrap();
    assert!(is_reference(stored.result.as_ref().unwrap()));

    // The checkpointed await step also holds the reference, not the bytes.
    let record = h.store.get_workflow(&wf).await.unwrap().unwrap();
    let summary = record
        .completed_step("research_phase_await")
        .unwrap()
        .result_summary
        .clone()
        .unwrap();
    assert!(is_reference(&summary));
}

#[tokio::test]
async fn failure_callback_marks_workflow_failed_but_still_acknowledges() {
    let h = Harness::new();
    let wf = h.start_workflow().await;
    let token = h.token_for(&wf, "research_phase_await").await;

    let (status, body) = h
        .post_json(
            "/callbacks",
            serde_json::json!({
                "token": token,
                "status": "FAILURE",
                "error": "source corpus unavailable",
            }),
        )
        .await;
    // Ingestion succeeds even though the resumption fails the workflow.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    let record = h.store.get_workflow(&wf).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowStatus::Failed);
    assert_eq!(record.error.as_ref().unwrap()["error_type"], "TaskFault");
}
