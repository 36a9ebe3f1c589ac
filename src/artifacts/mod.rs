pub mod local_store;
pub mod s3_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;

/// Serialized task payloads and step summaries above this size are
/// offloaded to the artifact store.
pub const TASK_PAYLOAD_THRESHOLD: usize = 200_000;

/// Callback results above this size are offloaded before persisting the
/// callback record.
pub const CALLBACK_RESULT_THRESHOLD: usize = 256_000;

const REFERENCE_TAG: &str = "reference";

/// Pointer to offloaded content. The artifact store owns the bytes; the
/// workflow state only ever holds this reference once the threshold is
/// exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    pub size_bytes: u64,
}

impl ArtifactRef {
    /// Tagged JSON form embedded in payloads and step summaries.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "artifact_type": REFERENCE_TAG,
            "uri": self.uri,
            "size_bytes": self.size_bytes,
        })
    }

    /// Parse a tagged reference back out of a JSON value.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("artifact_type")?.as_str()? != REFERENCE_TAG {
            return None;
        }
        Some(Self {
            uri: obj.get("uri")?.as_str()?.to_string(),
            size_bytes: obj.get("size_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
        })
    }
}

/// True if the value is a tagged artifact reference.
pub fn is_reference(value: &serde_json::Value) -> bool {
    ArtifactRef::from_value(value).is_some()
}

/// Size of a value once serialized for transport. Strings count their raw
/// bytes; everything else is measured as compact JSON.
pub fn serialized_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::String(s) => s.len(),
        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
    }
}

/// Serialize content for storage. Strings pass through untouched so text
/// artifacts stay readable; structured values become compact JSON.
pub fn serialize_content(content: &serde_json::Value) -> (Vec<u8>, bool) {
    match content {
        serde_json::Value::String(s) => (s.clone().into_bytes(), false),
        other => (
            serde_json::to_vec(other).unwrap_or_default(),
            true,
        ),
    }
}

/// Content-addressed-by-path blob storage with time-limited read handles.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store content under `key` and return a reference to it.
    async fn store(
        &self,
        key: &str,
        content: &serde_json::Value,
        content_type: &str,
    ) -> Result<ArtifactRef, EngineError>;

    /// Fetch content by URI. JSON content types are parsed back into
    /// structure; everything else comes back as opaque text.
    async fn fetch(&self, uri: &str) -> Result<serde_json::Value, EngineError>;

    /// Time-limited read URL for the artifact.
    async fn presigned_read_url(&self, uri: &str, ttl_s: u64) -> Result<String, EngineError>;
}
