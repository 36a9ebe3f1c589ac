use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;

use crate::artifacts::{ArtifactRef, ArtifactStore, serialize_content};
use crate::engine::error::EngineError;

const MAX_PRESIGN_TTL_S: u64 = 604_800;

/// S3-backed artifact store. Honors the usual endpoint/path-style
/// overrides so it also works against S3-compatible storage.
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a store from ambient AWS configuration. `AWS_ENDPOINT_URL`
    /// and `AWS_S3_FORCE_PATH_STYLE` redirect to S3-compatible backends.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let region = std::env::var("S3_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .ok();
        let endpoint_url = std::env::var("AWS_ENDPOINT_URL").ok();
        let force_path_style = std::env::var("AWS_S3_FORCE_PATH_STYLE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let base_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&base_config);
        builder = builder.force_path_style(force_path_style);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        Self::new(Client::from_conf(builder.build()), bucket)
    }

    fn parse_uri(uri: &str) -> Result<(String, String), EngineError> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| EngineError::Validation(format!("invalid S3 URI: {}", uri)))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok((bucket.to_string(), key.to_string()))
            }
            _ => Err(EngineError::Validation(format!(
                "invalid S3 URI format: {}",
                uri
            ))),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn store(
        &self,
        key: &str,
        content: &serde_json::Value,
        content_type: &str,
    ) -> Result<ArtifactRef, EngineError> {
        let (bytes, _structured) = serialize_content(content);
        let size_bytes = bytes.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| EngineError::Storage(format!("failed to store artifact {}: {}", key, e)))?;

        Ok(ArtifactRef {
            uri: format!("s3://{}/{}", self.bucket, key),
            size_bytes,
        })
    }

    async fn fetch(&self, uri: &str) -> Result<serde_json::Value, EngineError> {
        let (bucket, key) = Self::parse_uri(uri)?;

        let response = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| EngineError::Storage(format!("failed to fetch artifact {}: {}", uri, e)))?;

        let content_type = response
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| EngineError::Storage(format!("failed to read artifact {}: {}", uri, e)))?
            .into_bytes();

        if content_type.contains("json") {
            serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Storage(format!("corrupt artifact {}: {}", uri, e)))
        } else {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|e| EngineError::Storage(format!("non-UTF-8 artifact {}: {}", uri, e)))?;
            Ok(serde_json::Value::String(text))
        }
    }

    async fn presigned_read_url(&self, uri: &str, ttl_s: u64) -> Result<String, EngineError> {
        if ttl_s == 0 || ttl_s > MAX_PRESIGN_TTL_S {
            return Err(EngineError::Validation(format!(
                "presign TTL must be between 1 and {} seconds, got {}",
                MAX_PRESIGN_TTL_S, ttl_s
            )));
        }

        let (bucket, key) = Self::parse_uri(uri)?;

        let presign_config = PresigningConfig::expires_in(Duration::from_secs(ttl_s))
            .map_err(|e| EngineError::Validation(format!("invalid presign TTL: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .presigned(presign_config)
            .await
            .map_err(|e| {
                EngineError::Storage(format!("failed to presign URL for {}: {}", uri, e))
            })?;

        Ok(request.uri().to_string())
    }
}
