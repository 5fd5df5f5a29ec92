use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use testflow_core::config::{ApiMode, AppConfig, FailurePolicy};
use testflow_core::event::StatusBroadcaster;
use testflow_core::flow::Flow;
use testflow_core::traits::{FlowStore, RunStore};
use testflow_core::types::{ExecutionStatus, RunId, StatusEvent, TestRun};

use testflow_engine::{resolve, status_stream, RunLogger, RunScheduler};
use testflow_gateway::{AppState, GatewayServer};
use testflow_store::SqliteStore;

const DEFAULT_CONFIG: &str = "testflow.toml";

#[derive(Parser)]
#[command(name = "testflow", version, about = "Run API test flows as dependency graphs")]
struct Cli {
    /// Path to config file (default: ./testflow.toml if present)
    #[arg(short, long, env = "TESTFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file and report the result
    Run {
        /// Flow definition (JSON)
        flow: PathBuf,
        /// Maximum nodes in flight
        #[arg(long)]
        concurrency: Option<usize>,
        /// What to do with nodes whose dependency did not succeed
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        /// Answer API nodes with simulated responses instead of real requests
        #[arg(long)]
        simulate: bool,
        /// Store the flow and the run in the database
        #[arg(long)]
        save: bool,
        /// Print events and the final run as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Check a flow file and print its execution order
    Validate {
        /// Flow definition (JSON)
        flow: PathBuf,
    },
    /// Start the HTTP/WebSocket gateway server
    Serve,
    /// List stored runs of a flow
    History {
        flow_id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Skip,
    Continue,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Skip => FailurePolicy::Skip,
            PolicyArg::Continue => FailurePolicy::Continue,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("testflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "testflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(Path::new(DEFAULT_CONFIG))?,
    };

    match cli.command {
        Commands::Run {
            flow,
            concurrency,
            policy,
            simulate,
            save,
            json,
        } => {
            if let Some(n) = concurrency {
                config.engine.max_concurrency = n.max(1);
            }
            if let Some(p) = policy {
                config.engine.failure_policy = p.into();
            }
            if simulate {
                config.engine.api_mode = ApiMode::Simulated;
            }
            let flow = load_flow(&flow)?;
            let run = run_flow(&config, flow.clone(), json).await?;

            if save {
                let store = SqliteStore::open(&config.db_path())?;
                let mut flow = flow;
                flow.apply_run(&run);
                store.save_flow(&flow).await?;
                store.save_run(&run).await?;
                info!(run_id = %run.id, "Run saved");
            }

            if json {
                println!("{}", serde_json::to_string(&run)?);
            } else {
                print_summary(&run);
            }
            if !run.succeeded() {
                anyhow::bail!("flow '{}' failed", run.flow_id);
            }
        }
        Commands::Validate { flow } => {
            let flow = load_flow(&flow)?;
            let plan = resolve(&flow)?;
            println!("{} ({} nodes, {} edges)", flow.name, flow.nodes.len(), flow.edges.len());
            for (step, &idx) in plan.order.iter().enumerate() {
                let node = &flow.nodes[idx];
                println!("{:>3}. {} [{}] {}", step + 1, node.id, node.kind(), node.label);
            }
        }
        Commands::Serve => {
            let store = Arc::new(SqliteStore::open(&config.db_path())?);
            let broadcaster = Arc::new(StatusBroadcaster::new(config.broadcast.capacity));
            let scheduler = Arc::new(RunScheduler::new(&config, broadcaster)?);
            let run_log_dir = config.log.enabled.then(|| config.log_dir());
            let state = Arc::new(AppState::new(scheduler, store.clone(), store, run_log_dir));

            info!(bind = %config.gateway.bind, "Starting gateway");
            let server = GatewayServer::new(config.gateway.clone(), state);
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::History { flow_id, limit } => {
            let store = SqliteStore::open(&config.db_path())?;
            let runs = store.runs_for_flow(&flow_id, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded for '{}'", flow_id);
            }
            for run in runs {
                println!(
                    "{}  {:<8} {}  {:>6} ms  {}/{} ok",
                    run.id,
                    run.status,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.duration_ms.unwrap_or(0),
                    run.count(ExecutionStatus::Success),
                    run.node_results.len(),
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

fn load_flow(path: &Path) -> anyhow::Result<Flow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flow file {}", path.display()))?;
    let flow: Flow = serde_json::from_str(&content)
        .with_context(|| format!("invalid flow file {}", path.display()))?;
    Ok(flow)
}

/// Execute a flow, streaming status events to the terminal as they arrive.
async fn run_flow(config: &AppConfig, flow: Flow, json: bool) -> anyhow::Result<TestRun> {
    let broadcaster = Arc::new(StatusBroadcaster::new(config.broadcast.capacity));
    let scheduler = Arc::new(RunScheduler::new(config, broadcaster.clone())?);

    let run_id = RunId::new();
    let logger = config.log.enabled.then(|| {
        let rx = broadcaster.subscribe(&run_id);
        let logger = RunLogger::new(config.log_dir());
        let flow_id = flow.id.clone();
        let id = run_id.clone();
        tokio::spawn(async move { logger.run(&flow_id, id, rx, CancellationToken::new()).await })
    });

    let handle = scheduler.start_as(flow, run_id);

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        eprintln!("\nCancelling run...");
        cancel.cancel();
    });

    let printer = tokio::spawn(async move {
        let events = status_stream(handle.events);
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            if json {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{}", line);
                }
            } else {
                print_event(&event);
            }
        }
    });

    let result = handle.join.await.context("run task panicked")?;
    printer.await.ok();
    if let Some(task) = logger {
        if let Ok(Some(path)) = task.await {
            info!(path = %path.display(), "Run log written");
        }
    }
    Ok(result?)
}

fn print_event(event: &StatusEvent) {
    match event {
        StatusEvent::NodeUpdate {
            node_id,
            status: ExecutionStatus::Running,
            ..
        } => eprintln!("[{}] running", node_id),
        StatusEvent::NodeUpdate {
            node_id,
            status,
            error,
            duration_ms,
            ..
        } => match error {
            Some(e) => eprintln!("[{}] {}: {}", node_id, status, e),
            None => eprintln!("[{}] {} ({} ms)", node_id, status, duration_ms.unwrap_or(0)),
        },
        StatusEvent::RunComplete { status, error, .. } => match error {
            Some(e) => eprintln!("run {}: {}", status, e),
            None => eprintln!("run {}", status),
        },
    }
}

fn print_summary(run: &TestRun) {
    println!();
    println!("Flow:     {}", run.flow_name.as_deref().unwrap_or(&run.flow_id));
    println!("Run:      {}", run.id);
    println!("Status:   {}", run.status);
    println!("Duration: {} ms", run.duration_ms.unwrap_or(0));
    println!(
        "Nodes:    {} success, {} failed, {} skipped",
        run.count(ExecutionStatus::Success),
        run.count(ExecutionStatus::Failed),
        run.count(ExecutionStatus::Skipped),
    );
}
