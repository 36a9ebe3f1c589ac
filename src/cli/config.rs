use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `anchorflow.yaml`.
/// All fields are optional — missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AnchorflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_dir: Option<String>,
    /// Local artifact directory; ignored when `s3_bucket` is set.
    pub artifacts_dir: Option<String>,
    /// S3 bucket for artifact offload. When set, artifacts go to S3 instead
    /// of the local filesystem.
    pub s3_bucket: Option<String>,
    /// Public base URL agents use to reach the callback ingress.
    pub callback_base_url: Option<String>,
    pub researcher_url: Option<String>,
    pub analyst_url: Option<String>,
    pub writer_url: Option<String>,
    pub research_timeout_s: Option<u64>,
    pub analysis_timeout_s: Option<u64>,
    pub writing_timeout_s: Option<u64>,
    pub approval_timeout_s: Option<u64>,
    pub max_body: Option<usize>,
    pub sweep_interval_s: Option<u64>,
}

impl AnchorflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `anchorflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("anchorflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: AnchorflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}
