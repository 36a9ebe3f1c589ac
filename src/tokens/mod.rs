use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::engine::error::EngineError;
use crate::engine::types::{CallbackConfig, CallbackRegistration};
use crate::storage::StateStore;

/// Issues unforgeable resumption tokens bound to one suspension point of
/// one workflow, and maintains the token → registration index in the store.
#[derive(Clone)]
pub struct TokenRegistry {
    store: Arc<dyn StateStore>,
    callback_base_url: String,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn StateStore>, callback_base_url: impl Into<String>) -> Self {
        Self {
            store,
            callback_base_url: callback_base_url.into(),
        }
    }

    /// Callback config for a suspension point. An existing registration is
    /// reused so dispatch and await stay bound to the same token across
    /// re-invocations; a new token (uuid v4, 122 bits of entropy) is minted
    /// only when none exists yet.
    pub async fn issue_or_reuse(
        &self,
        workflow_id: &str,
        step_name: &str,
        timeout_s: u64,
    ) -> Result<CallbackConfig, EngineError> {
        if let Some(existing) = self.store.get_registration(workflow_id, step_name).await? {
            return Ok(self.config_for(&existing));
        }

        let registration = CallbackRegistration {
            workflow_id: workflow_id.to_string(),
            step_name: step_name.to_string(),
            token: Uuid::new_v4().to_string(),
            issued_at: Utc::now(),
            timeout_s,
            consumed: false,
        };
        self.store.put_registration(&registration).await?;

        info!(
            workflow_id = %workflow_id,
            step_name = %step_name,
            timeout_s = timeout_s,
            "callback token issued"
        );

        Ok(self.config_for(&registration))
    }

    /// Registration owning a token, via the secondary index.
    pub async fn resolve(
        &self,
        token: &str,
    ) -> Result<Option<CallbackRegistration>, EngineError> {
        self.store.find_registration(token).await
    }

    /// Mark a token consumed; a second consume is a no-op.
    pub async fn consume(&self, token: &str) -> Result<(), EngineError> {
        self.store.mark_consumed(token).await
    }

    pub fn config_for(&self, registration: &CallbackRegistration) -> CallbackConfig {
        CallbackConfig {
            workflow_id: registration.workflow_id.clone(),
            step_name: registration.step_name.clone(),
            token: registration.token.clone(),
            callback_url: format!(
                "{}/callbacks",
                self.callback_base_url.trim_end_matches('/')
            ),
            expires_at: registration.expires_at(),
        }
    }
}
