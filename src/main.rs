mod workflow;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use stepgraph_core::config::AppConfig;
use stepgraph_core::event::EventBus;
use stepgraph_core::state::State;
use stepgraph_core::types::RunStatus;
use stepgraph_engine::RunManager;
use stepgraph_gateway::GatewayServer;
use stepgraph_history::SqliteHistory;

#[derive(Parser)]
#[command(name = "stepgraph", version, about = "Stateful workflow graph engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepgraph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve,
    /// Run the workflow once and print the final run snapshot
    Run {
        /// User input (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
    },
    /// Print the workflow graph
    Graph,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepgraph=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepgraph", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config");
        AppConfig::load(&cli.config)?
    } else {
        debug!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::default()
    };

    let graph = Arc::new(workflow::build_graph(&config.engine)?);
    let event_bus = Arc::new(EventBus::default());
    let runs = RunManager::new(
        graph,
        config.engine.clone(),
        config.runs.clone(),
        Some(event_bus.clone()),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(log_events(event_bus.clone(), cancel.clone()));

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => {
            print!("{}", runs.graph().describe());
        }
        Commands::Run { input } => {
            let mut text = input.join(" ");
            if text.is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            if text.trim().is_empty() {
                anyhow::bail!("no input provided");
            }

            let initial = State::from_map([("user_input".to_string(), serde_json::json!(text))]);
            let run_id = runs.start(initial)?;
            let snapshot = runs.wait(&run_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);

            if snapshot.status != RunStatus::Completed {
                let reason = snapshot
                    .error
                    .map(|f| f.message)
                    .unwrap_or_else(|| snapshot.status.to_string());
                anyhow::bail!("run {} {}: {}", run_id, snapshot.status, reason);
            }
        }
        Commands::Serve => {
            let gateway_config = config.gateway.clone().unwrap_or_default();
            let history = Arc::new(SqliteHistory::from_location(&config.history.path)?);
            info!(
                bind = %gateway_config.bind,
                history = %config.history.path,
                max_concurrent_runs = config.runs.max_concurrent_runs,
                "Starting gateway"
            );

            let server = GatewayServer::new(
                gateway_config,
                runs.clone(),
                history,
                config.history.default_limit,
            );

            // Graceful shutdown on Ctrl-C
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            let reaper = runs.clone();
            let reaper_cancel = cancel.clone();
            tokio::spawn(async move { reaper.run_reaper(reaper_cancel).await });

            server.run(cancel.clone()).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    cancel.cancel();
    Ok(())
}

/// Mirror run lifecycle events into the debug log.
async fn log_events(event_bus: Arc<EventBus>, cancel: CancellationToken) {
    let mut rx = event_bus.subscribe();
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = cancel.cancelled() => return,
        };
        match event {
            Ok(event) => debug!(?event, "Run event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event log lagging");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
