use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft::adapters::AdapterRegistry;
use weft::config::Config;
use weft::engine::{CancelOutcome, Engine};
use weft::events::EventSink;
use weft::graph::{compile, parse_definition_file};
use weft::state::{RunStatus, SqliteStore};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Agent workflow orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (API + engine)
    Serve {
        /// Port to listen on (config/env default when omitted)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Start a run of a stored workflow and wait for it
    Run {
        /// Workflow name or ID
        name: String,
        /// JSON input data
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Inspect and control runs
    Runs {
        #[command(subcommand)]
        action: RunActions,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// List all workflows
    List,
    /// Register a workflow from a YAML file
    Create {
        /// Path to workflow YAML file
        file: String,
    },
    /// Compile a workflow file without storing it
    Validate {
        /// Path to workflow YAML file
        file: String,
    },
    /// Show a stored workflow definition
    Show {
        /// Workflow name or ID
        name: String,
    },
}

#[derive(Subcommand)]
enum RunActions {
    /// List recent runs
    List {
        /// Status filter: pending|running|succeeded|failed|cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show a run with its node executions
    Show {
        /// Run ID
        id: String,
    },
    /// Cancel a run
    Cancel {
        /// Run ID
        id: String,
    },
    /// Show the event stream of a run
    Events {
        /// Run ID
        id: String,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "weft=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => cmd_serve(port).await?,
        Commands::Workflows { action } => match action {
            WorkflowActions::List => cmd_workflows_list().await?,
            WorkflowActions::Create { file } => cmd_workflows_create(&file).await?,
            WorkflowActions::Validate { file } => cmd_workflows_validate(&file)?,
            WorkflowActions::Show { name } => cmd_workflows_show(&name).await?,
        },
        Commands::Run { name, input } => cmd_run(&name, input.as_deref()).await?,
        Commands::Runs { action } => match action {
            RunActions::List { status, limit } => cmd_runs_list(status.as_deref(), limit).await?,
            RunActions::Show { id } => cmd_runs_show(&id).await?,
            RunActions::Cancel { id } => cmd_runs_cancel(&id).await?,
            RunActions::Events { id } => cmd_runs_events(&id).await?,
        },
        Commands::Completions { shell } => cmd_completions(shell)?,
    }

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStore::open(&db_path)?)
}

fn build_engine(config: &Config, store: SqliteStore) -> Arc<Engine> {
    let adapters = AdapterRegistry::with_defaults(&config.backends);
    let (events, _writer) = EventSink::spawn(store.clone(), config.engine.event_buffer);
    Engine::new(store, adapters, events, config.engine.workers)
}

// ============================================================================
// Server
// ============================================================================

async fn cmd_serve(port: Option<u16>) -> anyhow::Result<()> {
    use weft::api::{create_router, AppState};
    use weft::shutdown::ShutdownCoordinator;

    let mut config = Config::load();
    if let Some(port) = port {
        config.server.port = port;
    }

    weft::metrics::init_metrics();

    let store = open_store(&config)?;
    let engine = build_engine(&config, store);
    let resumed = engine.recover().await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();

    let app = create_router(AppState {
        engine: engine.clone(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("weft server running on http://{}", addr);
    if resumed > 0 {
        println!("Resumed {} unfinished run(s)", resumed);
    }
    println!();
    println!("API endpoints:");
    println!("  GET  /health");
    println!("  GET  /metrics");
    println!("  POST /api/v1/workflows");
    println!("  GET  /api/v1/workflows");
    println!("  GET  /api/v1/workflows/:name");
    println!("  POST /api/v1/runs");
    println!("  GET  /api/v1/runs");
    println!("  GET  /api/v1/runs/:id");
    println!("  POST /api/v1/runs/:id/cancel");
    println!("  GET  /api/v1/runs/:id/events");
    println!();
    println!("Press Ctrl+C to stop");

    let waiter = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { waiter.wait_for_shutdown().await })
        .await?;

    engine.shutdown().await;
    println!("Server stopped.");
    Ok(())
}

// ============================================================================
// Workflow commands
// ============================================================================

async fn cmd_workflows_list() -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;
    let workflows = store.list_workflows().await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Register one with: weft workflows create <file.yaml>");
        return Ok(());
    }

    println!("{:<30} {:<10} {:<20}", "NAME", "VERSION", "UPDATED");
    println!("{}", "-".repeat(62));
    for wf in workflows {
        println!(
            "{:<30} {:<10} {:<20}",
            wf.name,
            wf.version,
            wf.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_workflows_create(file: &str) -> anyhow::Result<()> {
    let definition = parse_definition_file(std::path::Path::new(file))?;
    let graph = compile(&definition)?;

    let config = Config::load();
    let store = open_store(&config)?;
    let yaml = std::fs::read_to_string(file)?;
    let stored = store.save_workflow(&definition.name, &yaml).await?;

    println!(
        "Registered workflow '{}' (version {}, {} nodes)",
        stored.name,
        stored.version,
        graph.node_count()
    );
    Ok(())
}

fn cmd_workflows_validate(file: &str) -> anyhow::Result<()> {
    let definition = parse_definition_file(std::path::Path::new(file))?;
    match compile(&definition) {
        Ok(graph) => {
            println!(
                "OK: '{}' compiles ({} nodes, start '{}', {} end(s))",
                definition.name,
                graph.node_count(),
                graph.start_id(),
                graph.end_ids().len()
            );
            println!("Topological order: {}", graph.topo_order().join(" -> "));
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn cmd_workflows_show(name: &str) -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;
    match store.get_workflow(name).await? {
        Some(wf) => {
            println!("# {} (version {}, id {})", wf.name, wf.version, wf.id);
            println!("{}", wf.definition);
            Ok(())
        }
        None => anyhow::bail!("Workflow '{}' not found", name),
    }
}

// ============================================================================
// Run commands
// ============================================================================

async fn cmd_run(name: &str, input: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;
    let engine = build_engine(&config, store.clone());

    let workflow = store
        .get_workflow(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Workflow '{}' not found", name))?;

    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw)?,
        None => json!({}),
    };

    let run = engine.run_to_completion(&workflow, input).await?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_runs_list(status: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;

    let status = status
        .map(|s| {
            s.parse::<RunStatus>()
                .map_err(|e| anyhow::anyhow!("{}", e))
        })
        .transpose()?;
    let runs = store.list_runs(status, limit).await?;
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<10} {:<20}", "RUN", "WORKFLOW", "STATUS", "STARTED");
    println!("{}", "-".repeat(94));
    for run in runs {
        println!(
            "{:<38} {:<24} {:<10} {:<20}",
            run.id,
            run.workflow_name,
            run.status.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_runs_show(id: &str) -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;
    match store.snapshot(id).await? {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        None => anyhow::bail!("Run '{}' not found", id),
    }
}

async fn cmd_runs_cancel(id: &str) -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;
    let engine = build_engine(&config, store);
    match engine.cancel_run(id).await? {
        CancelOutcome::Accepted => {
            println!("Run '{}' cancelled", id);
            Ok(())
        }
        CancelOutcome::AlreadyFinished => anyhow::bail!("Run '{}' already finished", id),
        CancelOutcome::NotFound => anyhow::bail!("Run '{}' not found", id),
    }
}

async fn cmd_runs_events(id: &str) -> anyhow::Result<()> {
    let config = Config::load();
    let store = open_store(&config)?;
    if store.get_run(id).await?.is_none() {
        anyhow::bail!("Run '{}' not found", id);
    }
    for event in store.list_events(id).await? {
        println!(
            "{} {:<16} {}",
            event.created_at.format("%H:%M:%S%.3f"),
            event.kind,
            event.payload
        );
    }
    Ok(())
}

fn cmd_completions(shell: CompletionShell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell: Shell = shell.into();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}
