pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::artifacts::local_store::LocalArtifactStore;
use crate::artifacts::s3_store::S3ArtifactStore;
use crate::dispatch::HttpDispatcher;
use crate::engine::pipeline::{Orchestrator, PipelineConfig};
use crate::engine::types::WorkflowStatus;
use crate::storage::StateStore;
use crate::storage::json_store::JsonStateStore;

use config::AnchorflowConfig;

#[derive(Parser)]
#[command(name = "anchorflow", version, about = "Durable multi-agent pipeline orchestrator")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to anchorflow.yaml (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server and the periodic timeout sweep
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// State store directory
        #[arg(long, env = "STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,

        /// Seconds between timeout sweeps (default: 60; 0 disables)
        #[arg(long, env = "SWEEP_INTERVAL_S")]
        sweep_interval_s: Option<u64>,
    },

    /// Start a new workflow from the command line
    Start {
        /// Topic for the pipeline to work on
        topic: String,

        /// Additional parameters as a JSON string
        #[arg(long)]
        parameters: Option<String>,
    },

    /// Show the full record of one workflow
    Status {
        /// Workflow ID
        workflow_id: String,
    },

    /// List workflows
    List {
        /// Filter by status (INITIALIZING, RUNNING, AWAITING_APPROVAL, PENDING, COMPLETED, REJECTED, FAILED)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Re-invoke a suspended workflow
    Resume {
        /// Workflow ID
        workflow_id: String,
    },

    /// Run one timeout sweep over suspended workflows and exit
    Sweep,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = AnchorflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_dir,
            max_body,
            sweep_interval_s,
        } => {
            let host = host
                .or_else(|| config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(config.port).unwrap_or(8080);
            let max_body = max_body.or(config.max_body).unwrap_or(1_048_576);
            let sweep_interval_s = sweep_interval_s.or(config.sweep_interval_s).unwrap_or(60);
            let sweep = (sweep_interval_s > 0).then_some(sweep_interval_s);

            let orchestrator = build_orchestrator(&config, store_dir).await?;
            crate::api::serve(orchestrator, &host, port, max_body, sweep).await
        }
        Commands::Start { topic, parameters } => {
            let parameters = match parameters {
                Some(json) => serde_json::from_str(&json)
                    .with_context(|| "Failed to parse --parameters JSON")?,
                None => serde_json::json!({}),
            };

            let orchestrator = build_orchestrator(&config, None).await?;
            let outcome = orchestrator.start(&topic, parameters).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Status { workflow_id } => {
            let orchestrator = build_orchestrator(&config, None).await?;
            let record = orchestrator
                .store()
                .get_workflow(&workflow_id)
                .await?
                .with_context(|| format!("Workflow '{}' not found", workflow_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::List { status, format } => cmd_list(&config, status, format).await,
        Commands::Resume { workflow_id } => {
            let orchestrator = build_orchestrator(&config, None).await?;
            let outcome = orchestrator.resume(&workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Sweep => {
            let orchestrator = build_orchestrator(&config, None).await?;
            let summary = orchestrator.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found, nothing to load
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Wire the engine from config: JSON state store, local or S3 artifacts,
/// HTTP dispatch. The same wiring serves the API server and the one-shot
/// commands.
async fn build_orchestrator(
    config: &AnchorflowConfig,
    store_dir_override: Option<PathBuf>,
) -> Result<Arc<Orchestrator>> {
    let store_dir = store_dir_override
        .or_else(|| config.store_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data/state"));
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(store_dir));

    let artifacts: Arc<dyn ArtifactStore> = match &config.s3_bucket {
        Some(bucket) => Arc::new(S3ArtifactStore::from_env(bucket.clone()).await),
        None => {
            let dir = config
                .artifacts_dir
                .clone()
                .unwrap_or_else(|| "data/artifacts".to_string());
            Arc::new(LocalArtifactStore::new(dir))
        }
    };

    let dispatcher = Arc::new(HttpDispatcher::new(30)?);

    let defaults = PipelineConfig::default();
    let pipeline = PipelineConfig {
        callback_base_url: config
            .callback_base_url
            .clone()
            .unwrap_or(defaults.callback_base_url),
        researcher_url: config
            .researcher_url
            .clone()
            .unwrap_or(defaults.researcher_url),
        analyst_url: config.analyst_url.clone().unwrap_or(defaults.analyst_url),
        writer_url: config.writer_url.clone().unwrap_or(defaults.writer_url),
        research_timeout_s: config
            .research_timeout_s
            .unwrap_or(defaults.research_timeout_s),
        analysis_timeout_s: config
            .analysis_timeout_s
            .unwrap_or(defaults.analysis_timeout_s),
        writing_timeout_s: config
            .writing_timeout_s
            .unwrap_or(defaults.writing_timeout_s),
        approval_timeout_s: config
            .approval_timeout_s
            .unwrap_or(defaults.approval_timeout_s),
        review_url_ttl_s: defaults.review_url_ttl_s,
        report_url_ttl_s: defaults.report_url_ttl_s,
    };

    Ok(Arc::new(Orchestrator::new(
        store, artifacts, dispatcher, pipeline,
    )))
}

async fn cmd_list(
    config: &AnchorflowConfig,
    status_filter: Option<String>,
    format: String,
) -> Result<()> {
    let orchestrator = build_orchestrator(config, None).await?;

    let status = status_filter
        .as_deref()
        .map(|s| match s {
            "INITIALIZING" => Ok(WorkflowStatus::Initializing),
            "RUNNING" => Ok(WorkflowStatus::Running),
            "AWAITING_APPROVAL" => Ok(WorkflowStatus::AwaitingApproval),
            "PENDING" => Ok(WorkflowStatus::Pending),
            "COMPLETED" => Ok(WorkflowStatus::Completed),
            "REJECTED" => Ok(WorkflowStatus::Rejected),
            "FAILED" => Ok(WorkflowStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid status filter: {}", s)),
        })
        .transpose()?;

    let workflows = orchestrator.store().list_workflows(status).await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    // Table format
    println!(
        "{:<38} {:<24} {:<18} {:<20}",
        "WORKFLOW ID", "TOPIC", "STATUS", "CURRENT STEP"
    );
    println!("{}", "-".repeat(100));

    for wf in &workflows {
        let topic = if wf.topic.len() > 22 {
            format!("{}…", wf.topic.chars().take(21).collect::<String>())
        } else {
            wf.topic.clone()
        };
        println!(
            "{:<38} {:<24} {:<18} {:<20}",
            wf.workflow_id, topic, wf.status, wf.current_step
        );
    }

    println!("\nTotal: {} workflow(s)", workflows.len());
    Ok(())
}
