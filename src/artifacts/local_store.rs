use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactRef, ArtifactStore, serialize_content};
use crate::engine::error::EngineError;

/// Filesystem-backed artifact store for development and tests. Each
/// artifact is a file under `base_dir` plus a content-type sidecar.
pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct ArtifactMeta {
    content_type: String,
}

impl LocalArtifactStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn path_from_uri(uri: &str) -> Result<PathBuf, EngineError> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| EngineError::Validation(format!("invalid artifact URI: {}", uri)))?;
        Ok(PathBuf::from(path))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".meta.json");
        path.with_file_name(name)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(
        &self,
        key: &str,
        content: &serde_json::Value,
        content_type: &str,
    ) -> Result<ArtifactRef, EngineError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(EngineError::storage)?;
        }

        let (bytes, _structured) = serialize_content(content);
        let size_bytes = bytes.len() as u64;

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(EngineError::storage)?;

        let meta = ArtifactMeta {
            content_type: content_type.to_string(),
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(EngineError::storage)?;
        tokio::fs::write(Self::meta_path(&path), meta_bytes)
            .await
            .map_err(EngineError::storage)?;

        Ok(ArtifactRef {
            uri: format!("file://{}", path.display()),
            size_bytes,
        })
    }

    async fn fetch(&self, uri: &str) -> Result<serde_json::Value, EngineError> {
        let path = Self::path_from_uri(uri)?;
        let bytes = tokio::fs::read(&path).await.map_err(EngineError::storage)?;

        let content_type = match tokio::fs::read(Self::meta_path(&path)).await {
            Ok(meta_bytes) => serde_json::from_slice::<ArtifactMeta>(&meta_bytes)
                .map(|m| m.content_type)
                .unwrap_or_else(|_| "application/octet-stream".to_string()),
            Err(_) => "application/octet-stream".to_string(),
        };

        if content_type.contains("json") {
            serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Storage(format!("corrupt artifact {}: {}", uri, e)))
        } else {
            let text = String::from_utf8(bytes)
                .map_err(|e| EngineError::Storage(format!("non-UTF-8 artifact {}: {}", uri, e)))?;
            Ok(serde_json::Value::String(text))
        }
    }

    async fn presigned_read_url(&self, uri: &str, ttl_s: u64) -> Result<String, EngineError> {
        // Local files have no signing authority; the URL still carries the
        // requested lifetime so callers can log and display it.
        let path = Self::path_from_uri(uri)?;
        if !path.exists() {
            return Err(EngineError::Storage(format!("artifact not found: {}", uri)));
        }
        Ok(format!("{}?expires_in={}", uri, ttl_s))
    }
}
