use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_agent::{AgentPool, DependencyGraph, Orchestrator, WorkflowEngine};
use weft_core::config::{AppConfig, StoreBackend};
use weft_core::traits::StateStore;
use weft_core::types::{Context, ExecutionState};
use weft_core::workflow::{TaskType, WorkflowDefinition};
use weft_core::InMemoryEventBus;
use weft_memory::{InMemoryStateStore, SqliteStateStore};
use weft_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "weft", version, about = "Agent and tool workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition and print the result as JSON
    Run {
        /// Workflow file (.json, .yaml, .yml, or .toml)
        workflow: PathBuf,
        /// Workflow input as key=value; values that parse as JSON are used as JSON
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Workflow inputs as a JSON object, applied before --input
        #[arg(long)]
        inputs_json: Option<String>,
        /// Execution id (generated if not provided)
        #[arg(long)]
        execution_id: Option<String>,
    },
    /// Check a workflow definition without running it
    Validate {
        workflow: PathBuf,
    },
    /// Print the readiness rounds of a workflow, assuming every task succeeds
    Plan {
        workflow: PathBuf,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.config.exists() {
        info!(path = %cli.config.display(), "Loaded config");
    }

    match cli.command {
        Commands::Run {
            workflow,
            inputs,
            inputs_json,
            execution_id,
        } => {
            let inputs = parse_inputs(inputs_json.as_deref(), &inputs)?;
            run_workflow(&config, &workflow, inputs, execution_id).await
        }
        Commands::Validate { workflow } => validate_workflow(&workflow),
        Commands::Plan { workflow } => plan_workflow(&workflow),
        Commands::Completions { .. } => Ok(()),
    }
}

async fn run_workflow(
    config: &AppConfig,
    path: &Path,
    inputs: Context,
    execution_id: Option<String>,
) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;

    let state: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryStateStore::new()),
        StoreBackend::Sqlite => {
            let db_path = config.store.resolved_path();
            info!(path = %db_path.display(), "Using SQLite state store");
            Arc::new(SqliteStateStore::open(&db_path)?)
        }
    };
    let events = Arc::new(InMemoryEventBus::new(config.orchestrator.event_capacity));
    let pool = Arc::new(AgentPool::new());
    let orchestrator = Arc::new(
        Orchestrator::new(pool, state, events)
            .with_config(config.orchestrator.clone())
            .with_resilience(&config.resilience),
    );

    for task in &definition.tasks {
        if task.task_type == TaskType::Agent {
            warn!(
                task_id = %task.id,
                agent_id = task.agent_id.as_deref().unwrap_or_default(),
                "No language-model backend is configured; agent tasks will fail"
            );
        }
    }

    let engine = WorkflowEngine::new(definition, orchestrator, ToolRegistry::with_builtins())?
        .with_config(config.engine.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling workflow");
            on_signal.cancel();
        }
    });

    let result = engine.execute_with_cancel(inputs, execution_id, cancel).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.state != ExecutionState::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_workflow(path: &Path) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;
    definition.validate()?;
    let graph = DependencyGraph::from_workflow(&definition)?;
    let rounds = graph.plan()?;
    println!(
        "{} ({}): {} tasks, {} scheduled in {} rounds",
        definition.id,
        definition.version,
        definition.tasks.len(),
        graph.len(),
        rounds.len()
    );
    Ok(())
}

fn plan_workflow(path: &Path) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;
    definition.validate()?;
    let graph = DependencyGraph::from_workflow(&definition)?;
    for (i, round) in graph.plan()?.iter().enumerate() {
        println!("{}: {}", i + 1, round.join(", "));
    }
    let detached = definition.detached_task_ids();
    if !detached.is_empty() {
        let mut detached: Vec<String> = detached.into_iter().collect();
        detached.sort();
        println!("detached: {}", detached.join(", "));
    }
    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    WorkflowDefinition::from_path(path)
        .with_context(|| format!("failed to load workflow {}", path.display()))
}

/// Merge `--inputs-json` with `--input key=value` pairs. Pairs win.
fn parse_inputs(json: Option<&str>, pairs: &[String]) -> anyhow::Result<Context> {
    let mut inputs = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--inputs-json is not valid JSON")? {
            Value::Object(map) => map,
            other => bail!("--inputs-json must be a JSON object, got {}", other),
        },
        None => Context::new(),
    };
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("--input expects KEY=VALUE, got {:?}", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}
