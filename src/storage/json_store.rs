use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::engine::error::EngineError;
use crate::engine::types::*;
use crate::storage::{StateStore, StatusExtra, apply_status_update};

/// File-based JSON state store. Each workflow record, callback registration
/// and callback result is its own file; the token index is a directory of
/// pointer files so callback lookup never scans workflow records.
pub struct JsonStateStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

/// Token index entry: token file → owning suspension point.
#[derive(Serialize, Deserialize)]
struct TokenPointer {
    workflow_id: String,
    step_name: String,
}

impl JsonStateStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.base_dir
            .join("workflows")
            .join(format!("{}.json", workflow_id))
    }

    fn registration_path(&self, workflow_id: &str, step_name: &str) -> PathBuf {
        self.base_dir
            .join("registrations")
            .join(workflow_id)
            .join(format!("{}.json", step_name))
    }

    fn token_path(&self, token: &str) -> PathBuf {
        self.base_dir.join("tokens").join(format!("{}.json", token))
    }

    fn callback_path(&self, token: &str) -> PathBuf {
        self.base_dir
            .join("callbacks")
            .join(format!("{}.json", token))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        path: &Path,
    ) -> Result<Option<T>, EngineError> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => {
                let value = serde_json::from_str(&data).map_err(|e| {
                    EngineError::Storage(format!("corrupt record {}: {}", path.display(), e))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::storage(e)),
        }
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(EngineError::storage)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(value).map_err(EngineError::storage)?;
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(EngineError::storage)?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(EngineError::storage)?;

        Ok(())
    }

    async fn read_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, EngineError> {
        Self::read_json(&self.workflow_path(workflow_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn create_workflow(&self, record: &WorkflowRecord) -> Result<(), EngineError> {
        let _lock = self.lock.write().await;

        let path = self.workflow_path(&record.workflow_id);
        if path.exists() {
            return Err(EngineError::AlreadyExists(record.workflow_id.clone()));
        }
        Self::write_json(&path, record).await
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, EngineError> {
        let _lock = self.lock.read().await;
        Self::read_json(&self.workflow_path(workflow_id)).await
    }

    async fn update_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        current_step: Option<&str>,
        extra: Option<StatusExtra>,
    ) -> Result<(), EngineError> {
        let _lock = self.lock.write().await;

        let mut record = self.read_workflow(workflow_id).await?;
        apply_status_update(&mut record, status, current_step, extra)?;
        Self::write_json(&self.workflow_path(workflow_id), &record).await
    }

    async fn append_step(&self, workflow_id: &str, step: &StepRecord) -> Result<(), EngineError> {
        let _lock = self.lock.write().await;

        let mut record = self.read_workflow(workflow_id).await?;
        record.steps_completed.push(step.clone());
        record.updated_at = chrono::Utc::now();
        Self::write_json(&self.workflow_path(workflow_id), &record).await
    }

    async fn list_workflows(
        &self,
        status_filter: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowRecord>, EngineError> {
        let _lock = self.lock.read().await;

        let dir = self.base_dir.join("workflows");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(EngineError::storage)?;

        while let Some(entry) = entries.next_entry().await.map_err(EngineError::storage)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(record) = serde_json::from_str::<WorkflowRecord>(&data)
            {
                if let Some(filter) = status_filter
                    && record.status != filter
                {
                    continue;
                }
                records.push(record);
            }
        }

        // Newest first
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records)
    }

    async fn put_registration(&self, reg: &CallbackRegistration) -> Result<(), EngineError> {
        let _lock = self.lock.write().await;

        Self::write_json(&self.registration_path(&reg.workflow_id, &reg.step_name), reg).await?;
        Self::write_json(
            &self.token_path(&reg.token),
            &TokenPointer {
                workflow_id: reg.workflow_id.clone(),
                step_name: reg.step_name.clone(),
            },
        )
        .await
    }

    async fn get_registration(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        let _lock = self.lock.read().await;
        Self::read_json(&self.registration_path(workflow_id, step_name)).await
    }

    async fn find_registration(
        &self,
        token: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        let _lock = self.lock.read().await;

        let pointer: Option<TokenPointer> = Self::read_json(&self.token_path(token)).await?;
        match pointer {
            Some(p) => Self::read_json(&self.registration_path(&p.workflow_id, &p.step_name)).await,
            None => Ok(None),
        }
    }

    async fn mark_consumed(&self, token: &str) -> Result<(), EngineError> {
        let _lock = self.lock.write().await;

        let pointer: Option<TokenPointer> = Self::read_json(&self.token_path(token)).await?;
        let Some(p) = pointer else {
            return Ok(());
        };

        let path = self.registration_path(&p.workflow_id, &p.step_name);
        if let Some(mut reg) = Self::read_json::<CallbackRegistration>(&path).await? {
            reg.consumed = true;
            Self::write_json(&path, &reg).await?;
        }
        Ok(())
    }

    async fn put_callback(&self, record: &CallbackRecord) -> Result<(), EngineError> {
        let _lock = self.lock.write().await;
        Self::write_json(&self.callback_path(&record.token), record).await
    }

    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRecord>, EngineError> {
        let _lock = self.lock.read().await;
        Self::read_json(&self.callback_path(token)).await
    }
}
