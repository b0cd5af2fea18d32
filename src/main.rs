use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodeflow_core::config::{dirs_home, AppConfig, HistoryBackend};
use nodeflow_core::event::EventBus;
use nodeflow_core::graph::FlowGraph;
use nodeflow_core::traits::HistoryStore;
use nodeflow_core::types::{FlowRunResult, NodeStatus, RunStatus};

use nodeflow_engine::{
    validate_report, AutosaveGuard, FlowExecutor, InMemoryHistory, RunLogger, RunOptions,
    SaveDecision,
};
use nodeflow_nodes::NodeRegistry;
use nodeflow_store::{SqliteGraphStore, SqliteHistoryStore};

#[derive(Parser)]
#[command(name = "nodeflow", version, about = "Run node-based flow graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "nodeflow.toml", env = "NODEFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow graph
    Run {
        /// Graph JSON file. Without it, the saved graph for --flow-key is used.
        graph: Option<PathBuf>,
        /// Flow key for history, logs and saved graphs
        #[arg(long, short = 'k', default_value = "default")]
        flow_key: String,
        /// Only run nodes reachable from this node
        #[arg(long)]
        trigger: Option<String>,
        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a graph without running it
    Validate {
        /// Graph JSON file
        graph: PathBuf,
    },
    /// List node types
    Nodes,
    /// Inspect past runs
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Save a graph under a flow key
    Save {
        /// Graph JSON file
        graph: PathBuf,
        #[arg(long, short = 'k', default_value = "default")]
        flow_key: String,
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

#[derive(Subcommand)]
enum HistoryAction {
    /// List runs, most recent first
    List {
        #[arg(long, short = 'k', default_value = "default")]
        flow_key: String,
    },
    /// Show one run as JSON
    Show {
        run_id: String,
        #[arg(long, short = 'k', default_value = "default")]
        flow_key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nodeflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "nodeflow", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli.config)?;
    let registry = Arc::new(build_registry(&config));

    match cli.command {
        Commands::Run {
            graph,
            flow_key,
            trigger,
            timeout,
            json,
        } => {
            let graph = match graph {
                Some(path) => read_graph(&path)?,
                None => {
                    let store = SqliteGraphStore::open(&config.autosave_path())?;
                    let snapshot = store.load(&flow_key)?.ok_or_else(|| {
                        anyhow::anyhow!("No saved graph for flow key '{}'", flow_key)
                    })?;
                    FlowGraph::from_document(snapshot.graph)?
                }
            };

            let mut options = RunOptions::new(&flow_key);
            if let Some(trigger) = trigger {
                options = options.with_trigger(trigger);
            }
            if let Some(secs) = timeout {
                options = options.with_deadline(Duration::from_secs(secs));
            }

            let result = run_graph(&config, registry, graph, options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_run(&result);
            }
            if result.status != RunStatus::Success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Validate { graph } => {
            let graph = read_graph(&graph)?;
            let report = validate_report(&graph, &registry);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Nodes => {
            let available = registry.list_available();
            for node_type in &available {
                let resolved = registry.resolve(node_type)?;
                println!(
                    "{:<16} {:<12} {}",
                    node_type,
                    resolved.tier.as_str(),
                    resolved.handler.display_name()
                );
            }
            for node_type in registry.list_catalog() {
                if !available.contains(&node_type) {
                    println!("{:<16} {:<12} (not installed)", node_type, "integration");
                }
            }
        }
        Commands::History { action } => {
            let history = open_history(&config)?;
            match action {
                HistoryAction::List { flow_key } => {
                    let runs = history.list(&flow_key)?;
                    if runs.is_empty() {
                        println!("No runs recorded for '{}'", flow_key);
                    }
                    for run in runs {
                        println!(
                            "{}  {}  {:<9}  {} nodes  {}ms",
                            run.started_at.format("%Y-%m-%d %H:%M:%S"),
                            run.run_id,
                            run.status.to_string(),
                            run.node_results.len(),
                            run.duration_ms().unwrap_or(0),
                        );
                    }
                }
                HistoryAction::Show { run_id, flow_key } => {
                    let run = history.get(&flow_key, &run_id)?;
                    println!("{}", serde_json::to_string_pretty(&run)?);
                }
            }
        }
        Commands::Save { graph, flow_key } => {
            let graph = read_graph(&graph)?;
            let store = Arc::new(SqliteGraphStore::open(&config.autosave_path())?);
            let baseline = match store.load(&flow_key)? {
                Some(snapshot) => Some(FlowGraph::from_document(snapshot.graph)?),
                None => None,
            };

            let guard = AutosaveGuard::new(store, flow_key.clone(), baseline.as_ref());
            let saved = match guard.on_graph_changed(&graph)? {
                SaveDecision::Persisted => true,
                SaveDecision::SkippedEmpty => {
                    anyhow::bail!("Refusing to overwrite '{}' with an empty graph", flow_key)
                }
                _ => guard.flush()?,
            };
            if saved {
                println!("Saved '{}' ({} nodes)", flow_key, graph.node_count());
            } else {
                println!("'{}' is already up to date", flow_key);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".nodeflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

fn build_registry(config: &AppConfig) -> NodeRegistry {
    let registry = NodeRegistry::with_builtins();
    let installed = config.registry.installed_set();
    for name in &installed {
        if !registry.list_catalog().contains(name) {
            warn!(node_type = %name, "Installed integration is not in the catalog");
        }
    }
    registry.register_conditionally(&installed);
    registry
}

fn open_history(config: &AppConfig) -> anyhow::Result<Arc<dyn HistoryStore>> {
    Ok(match config.history.backend {
        HistoryBackend::Sqlite => Arc::new(SqliteHistoryStore::open(
            &config.history_path(),
            config.history.cap,
        )?),
        HistoryBackend::Memory => {
            warn!("History backend is 'memory'; runs are not kept between invocations");
            Arc::new(InMemoryHistory::new(config.history.cap))
        }
    })
}

/// Process environment, overlaid with `[env]` from config.
fn handler_env(config: &AppConfig) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(config.env.clone());
    env
}

async fn run_graph(
    config: &AppConfig,
    registry: Arc<NodeRegistry>,
    graph: FlowGraph,
    options: RunOptions,
) -> anyhow::Result<FlowRunResult> {
    let event_bus = Arc::new(EventBus::default());
    let executor = Arc::new(
        FlowExecutor::new(registry)
            .with_config(config.engine.clone())
            .with_env(handler_env(config))
            .with_event_bus(event_bus.clone())
            .with_history(open_history(config)?),
    );

    let cancel = CancellationToken::new();
    let logger = match (config.log_dir(), &config.log) {
        (Some(dir), Some(log)) => Some(RunLogger::new(dir, log.level).start(
            &event_bus,
            options.run_id.clone(),
            options.flow_key.clone(),
            CancellationToken::new(),
        )),
        _ => None,
    };

    // Graceful shutdown on Ctrl-C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let result = executor.spawn(graph, options, cancel).await?;
    if let Some(logger) = logger {
        if let Some(path) = logger.await? {
            info!(path = %path.display(), "Run log written");
        }
    }
    Ok(result)
}

fn read_graph(path: &Path) -> anyhow::Result<FlowGraph> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok(FlowGraph::from_json(&content)?)
}

fn print_run(result: &FlowRunResult) {
    for node in &result.node_results {
        let mark = match node.status {
            NodeStatus::Success => "ok",
            NodeStatus::Error => "FAIL",
            NodeStatus::Skipped => "skip",
        };
        println!("[{:>4}] {} ({}) {}ms", mark, node.node_id, node.node_type, node.duration_ms());
        if let Some(error) = &node.error {
            println!("       {}", error);
        }
    }
    match &result.error {
        Some(error) => println!("Run {}: {} ({})", result.run_id, result.status, error),
        None => println!("Run {}: {}", result.run_id, result.status),
    }
}
