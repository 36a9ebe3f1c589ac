use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::engine::error::EngineError;

/// Outbound task dispatch to an external agent runtime. The agent either
/// acks synchronously or delivers its result later via the callback URL
/// embedded in the payload.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError>;
}

/// JSON-over-HTTP dispatcher.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(timeout_s: u64) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| EngineError::Dispatch(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AgentDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch(format!("failed to reach {}: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Dispatch(format!(
                "{} returned {}: {}",
                endpoint,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        info!(endpoint = %endpoint, status = %status, "task dispatched");

        // Agents are free to ack with anything; non-JSON acks are fine.
        Ok(response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null))
    }
}
