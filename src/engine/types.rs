use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a workflow record is kept before it becomes eligible for
/// reclamation. Reclamation itself is an operator concern; the engine only
/// stamps the expiry instant.
pub const WORKFLOW_TTL_DAYS: i64 = 30;

/// Retention for stored callback results.
pub const CALLBACK_TTL_DAYS: i64 = 14;

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Initializing,
    Running,
    AwaitingApproval,
    Pending,
    Completed,
    Rejected,
    Failed,
}

impl WorkflowStatus {
    /// Terminal statuses are immutable; no transition may leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Rejected | WorkflowStatus::Failed
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Initializing => "INITIALIZING",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::AwaitingApproval => "AWAITING_APPROVAL",
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Rejected => "REJECTED",
            WorkflowStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of an individual checkpointed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Success,
    Failed,
}

/// One entry in a workflow's append-only step history. The recorded
/// `result_summary` is what replay returns without re-running the step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub completed_at: DateTime<Utc>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl StepRecord {
    pub fn success(step_name: &str, result_summary: serde_json::Value) -> Self {
        Self {
            step_name: step_name.to_string(),
            completed_at: Utc::now(),
            status: StepStatus::Success,
            result_summary: Some(result_summary),
            error: None,
        }
    }

    pub fn failed(step_name: &str, error: serde_json::Value) -> Self {
        Self {
            step_name: step_name.to_string(),
            completed_at: Utc::now(),
            status: StepStatus::Failed,
            result_summary: None,
            error: Some(error),
        }
    }
}

/// Durable record of one workflow instance. The only fields mutated after
/// creation are `status`, `current_step`, `steps_completed`, `updated_at`
/// and the terminal fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub topic: String,
    pub parameters: serde_json::Value,
    pub status: WorkflowStatus,
    pub current_step: String,
    pub steps_completed: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl WorkflowRecord {
    pub fn new(workflow_id: &str, topic: &str, parameters: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            topic: topic.to_string(),
            parameters,
            status: WorkflowStatus::Initializing,
            current_step: "initialization".to_string(),
            steps_completed: Vec::new(),
            created_at: now,
            updated_at: now,
            ttl: now + Duration::days(WORKFLOW_TTL_DAYS),
            report_location: None,
            rejection_reason: None,
            error: None,
        }
    }

    /// Memoized result of a previously completed step, if any.
    pub fn completed_step(&self, step_name: &str) -> Option<&StepRecord> {
        self.steps_completed
            .iter()
            .find(|s| s.step_name == step_name && s.status == StepStatus::Success)
    }
}

/// Ephemeral registration binding one callback token to one suspension
/// point of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRegistration {
    pub workflow_id: String,
    pub step_name: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub timeout_s: u64,
    pub consumed: bool,
}

impl CallbackRegistration {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.timeout_s as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// Reported outcome of an external task, delivered to the callback ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Success,
    Failure,
}

/// A persisted callback delivery, keyed by token. Results above the
/// offload threshold are replaced by an artifact reference in `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub token: String,
    pub status: CallbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub ttl: DateTime<Utc>,
}

/// Everything an external system needs to deliver a completion signal back
/// to one suspension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub workflow_id: String,
    pub step_name: String,
    pub token: String,
    pub callback_url: String,
    pub expires_at: DateTime<Utc>,
}

/// What one orchestrator invocation reports when it returns control.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkflowOutcome {
    pub fn suspended(
        workflow_id: &str,
        status: WorkflowStatus,
        awaiting: &str,
        callback_url: String,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            status,
            awaiting: Some(awaiting.to_string()),
            callback_url: Some(callback_url),
            report_url: None,
            reason: None,
            message: Some(format!("workflow suspended, awaiting {}", awaiting)),
        }
    }
}
