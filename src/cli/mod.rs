pub mod config;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::api::ServeOptions;
use crate::engine::types::{HistoryEvent, WorkflowFilter, WorkflowStatus};
use crate::storage::WorkflowStore;
use crate::storage::json_store::JsonFileStore;

pub use config::ReplayflowConfig;

const DEFAULT_STORE_DIR: &str = "data/workflows";
const DEFAULT_COLLECTION: &str = "workflows";
const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "replayflow", version, about = "Durable workflow engine and state store")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a config file (default: auto-detect replayflow.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve a workflow store directory over HTTP
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// State store directory
        #[arg(long, env = "REPLAYFLOW_STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Collection path segment
        #[arg(long)]
        collection: Option<String>,

        /// Bearer token clients must present
        #[arg(long, env = "REPLAYFLOW_AUTH_KEY", hide_env_values = true)]
        auth_key: Option<String>,

        /// Maximum request body size in bytes
        #[arg(long)]
        max_body: Option<usize>,
    },

    /// List stored workflows
    List {
        /// Filter by status (pending, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of workflows to show (0 = all)
        #[arg(short, long, default_value = "0")]
        limit: usize,

        /// State store directory
        #[arg(long, env = "REPLAYFLOW_STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a stored workflow
    Inspect {
        /// Workflow ID
        workflow_id: String,

        /// Print the event history as a table
        #[arg(long)]
        history: bool,

        /// State store directory
        #[arg(long, env = "REPLAYFLOW_STORE_DIR")]
        store_dir: Option<PathBuf>,
    },

    /// Delete a stored workflow
    Delete {
        /// Workflow ID
        workflow_id: String,

        /// State store directory
        #[arg(long, env = "REPLAYFLOW_STORE_DIR")]
        store_dir: Option<PathBuf>,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());
    let config = ReplayflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_dir,
            collection,
            auth_key,
            max_body,
        } => {
            let options = ServeOptions {
                host: host
                    .or(config.host.clone())
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                port: port.or(config.port).unwrap_or(3000),
                store_dir: resolve_store_dir(store_dir, &config),
                collection: collection
                    .or(config.collection.clone())
                    .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
                auth_key: auth_key.or(config.auth_key.clone()),
                max_body: max_body.or(config.max_body).unwrap_or(DEFAULT_MAX_BODY),
            };
            crate::api::serve(options).await
        }
        Commands::List {
            status,
            limit,
            store_dir,
            format,
        } => cmd_list(status, limit, resolve_store_dir(store_dir, &config), format).await,
        Commands::Inspect {
            workflow_id,
            history,
            store_dir,
        } => cmd_inspect(workflow_id, history, resolve_store_dir(store_dir, &config)).await,
        Commands::Delete {
            workflow_id,
            store_dir,
        } => cmd_delete(workflow_id, resolve_store_dir(store_dir, &config)).await,
    }
}

fn resolve_store_dir(flag: Option<PathBuf>, config: &ReplayflowConfig) -> PathBuf {
    flag.or_else(|| config.store_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR))
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
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
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn cmd_list(
    status_filter: Option<String>,
    limit: usize,
    store_dir: PathBuf,
    format: String,
) -> Result<()> {
    let store = JsonFileStore::new(store_dir);

    let status = status_filter
        .as_deref()
        .map(|s| {
            s.parse::<WorkflowStatus>()
                .map_err(|e| anyhow::anyhow!("Invalid status filter: {}", e))
        })
        .transpose()?;
    let workflows = store.list(&WorkflowFilter { status, limit }).await?;

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
        "{:<40} {:<20} {:<10} {:>7}  {:<20}",
        "WORKFLOW ID", "TYPE", "STATUS", "EVENTS", "UPDATED"
    );
    println!("{}", "-".repeat(101));

    for wf in &workflows {
        println!(
            "{:<40} {:<20} {:<10} {:>7}  {:<20}",
            wf.workflow_id,
            wf.workflow_type,
            wf.status.to_string(),
            wf.history.len(),
            wf.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()
        );
    }

    println!("\nTotal: {} workflow(s)", workflows.len());
    Ok(())
}

async fn cmd_inspect(workflow_id: String, history: bool, store_dir: PathBuf) -> Result<()> {
    let store = JsonFileStore::new(store_dir);

    let state = store
        .load(&workflow_id)
        .await?
        .with_context(|| format!("Workflow '{}' not found", workflow_id))?;

    if !history {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!(
        "Workflow: {} [{}] {}",
        state.workflow_id, state.workflow_type, state.status
    );
    println!("Run ID:   {}\n", state.run_id);
    println!(
        "{:>5}  {:<20} {:<24} {:<14} DETAIL",
        "ID", "EVENT", "TIMESTAMP", "SEQUENCE"
    );
    println!("{}", "-".repeat(90));
    for event in &state.history {
        println!(
            "{:>5}  {:<20} {:<24} {:<14} {}",
            event.id,
            event.event_type.to_string(),
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            event
                .sequence
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            event_detail(event)
        );
    }
    println!("\nTotal: {} event(s)", state.history.len());

    Ok(())
}

async fn cmd_delete(workflow_id: String, store_dir: PathBuf) -> Result<()> {
    let store = JsonFileStore::new(store_dir);

    if store.load(&workflow_id).await?.is_none() {
        anyhow::bail!("Workflow '{}' not found", workflow_id);
    }
    store.delete(&workflow_id).await?;

    println!("Deleted workflow {}", workflow_id);
    Ok(())
}

fn event_detail(event: &HistoryEvent) -> String {
    if let Some(ref err) = event.error {
        return format!("error: {}", err);
    }
    let label = event
        .activity_name
        .as_deref()
        .or(event.signal_name.as_deref())
        .unwrap_or("");
    match event.attempts {
        Some(n) if n > 1 => format!("{} (attempts: {})", label, n),
        _ => label.to_string(),
    }
}
