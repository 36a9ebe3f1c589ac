use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::engine::error::EngineError;
use crate::engine::types::*;
use crate::storage::{StateStore, StatusExtra, apply_status_update};

/// In-memory state store. Holds state only for the lifetime of the store
/// instance; used by tests and embedded runs.
pub struct MemoryStateStore {
    workflows: Mutex<HashMap<String, WorkflowRecord>>,
    // Keyed by (workflow_id, step_name); tokens maps token → that key.
    registrations: Mutex<HashMap<(String, String), CallbackRegistration>>,
    tokens: Mutex<HashMap<String, (String, String)>>,
    callbacks: Mutex<HashMap<String, CallbackRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_workflow(&self, record: &WorkflowRecord) -> Result<(), EngineError> {
        let mut workflows = self.workflows.lock().unwrap();
        if workflows.contains_key(&record.workflow_id) {
            return Err(EngineError::AlreadyExists(record.workflow_id.clone()));
        }
        workflows.insert(record.workflow_id.clone(), record.clone());
        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, EngineError> {
        Ok(self.workflows.lock().unwrap().get(workflow_id).cloned())
    }

    async fn update_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        current_step: Option<&str>,
        extra: Option<StatusExtra>,
    ) -> Result<(), EngineError> {
        let mut workflows = self.workflows.lock().unwrap();
        let record = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        apply_status_update(record, status, current_step, extra)
    }

    async fn append_step(&self, workflow_id: &str, step: &StepRecord) -> Result<(), EngineError> {
        let mut workflows = self.workflows.lock().unwrap();
        let record = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        record.steps_completed.push(step.clone());
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn list_workflows(
        &self,
        status_filter: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowRecord>, EngineError> {
        let workflows = self.workflows.lock().unwrap();
        let mut records: Vec<WorkflowRecord> = workflows
            .values()
            .filter(|r| status_filter.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn put_registration(&self, reg: &CallbackRegistration) -> Result<(), EngineError> {
        let key = (reg.workflow_id.clone(), reg.step_name.clone());
        self.tokens
            .lock()
            .unwrap()
            .insert(reg.token.clone(), key.clone());
        self.registrations.lock().unwrap().insert(key, reg.clone());
        Ok(())
    }

    async fn get_registration(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        let key = (workflow_id.to_string(), step_name.to_string());
        Ok(self.registrations.lock().unwrap().get(&key).cloned())
    }

    async fn find_registration(
        &self,
        token: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        let key = match self.tokens.lock().unwrap().get(token) {
            Some(key) => key.clone(),
            None => return Ok(None),
        };
        Ok(self.registrations.lock().unwrap().get(&key).cloned())
    }

    async fn mark_consumed(&self, token: &str) -> Result<(), EngineError> {
        let key = match self.tokens.lock().unwrap().get(token) {
            Some(key) => key.clone(),
            None => return Ok(()),
        };
        if let Some(reg) = self.registrations.lock().unwrap().get_mut(&key) {
            reg.consumed = true;
        }
        Ok(())
    }

    async fn put_callback(&self, record: &CallbackRecord) -> Result<(), EngineError> {
        self.callbacks
            .lock()
            .unwrap()
            .insert(record.token.clone(), record.clone());
        Ok(())
    }

    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRecord>, EngineError> {
        Ok(self.callbacks.lock().unwrap().get(token).cloned())
    }
}
