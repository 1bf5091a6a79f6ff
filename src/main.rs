mod input;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::AppConfig;
use stepwise_core::event::EventBus;
use stepwise_core::ids::{generate_plan_id, generate_request_id};
use stepwise_core::types::ExecutionEvent;
use stepwise_engine::{checked_order, ExecutionEngine};
use stepwise_mcp::{connect_catalog_server, McpToolProvider};
use stepwise_tools::{SharedCatalog, ToolCatalog, ToolInvoker};

use crate::input::ModeArg;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Run tool plans with output chaining")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml", env = "STEPWISE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file and print the run result
    Run {
        /// Plan file: a run request or a planner reply
        file: PathBuf,
        /// Execution mode (overrides the plan file and the config)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Order steps by their dependencies and run them chained
        #[arg(long, conflicts_with = "mode")]
        sorted: bool,
    },
    /// Print the dependency order of a plan file
    Order {
        file: PathBuf,
    },
    /// List tools offered by the catalog server
    Tools {
        #[arg(long)]
        category: Option<String>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

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

    if !cli.config.exists() {
        debug!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Run { file, mode, sorted } => run(&config, &file, mode, sorted).await,
        Commands::Order { file } => {
            let request = input::load_request(&file)?;
            let order = checked_order(&request.steps)?;
            print_json(&order)
        }
        Commands::Tools { category } => {
            let (provider, catalog) = connect(&config).await?;
            let tools = match category.as_deref() {
                Some(c) => catalog.by_category(c),
                None => catalog.all(),
            };
            print_json(&tools)?;
            provider.manager().disconnect_all().await;
            Ok(())
        }
        Commands::Config => print_json(&config),
    }
}

async fn run(
    config: &AppConfig,
    file: &Path,
    mode: Option<ModeArg>,
    sorted: bool,
) -> anyhow::Result<()> {
    let mut request = input::load_request(file)?;
    if request.request_id.is_none() {
        request.request_id = Some(generate_request_id());
    }
    if request.plan_id.is_none() {
        request.plan_id = Some(generate_plan_id());
    }

    let mode_override = input::apply_run_flags(&mut request, mode, sorted)?;

    let (provider, catalog) = connect(config).await?;
    let invoker = ToolInvoker::new(catalog, Arc::new(provider.clone()));

    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let logger = tokio::spawn(log_events(event_bus.subscribe()));
    let mut engine = ExecutionEngine::from_config(invoker, &config.engine).with_event_bus(event_bus);
    if let Some(preference) = mode_override {
        engine = engine.with_default_mode(preference);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let result = engine.invoke_with_cancel(request, cancel).await;
    // Dropping the engine closes the bus and lets the logger drain.
    drop(engine);
    let _ = logger.await;
    provider.manager().disconnect_all().await;

    let result = result?;
    info!(
        run_id = %result.run_id,
        state = ?result.state(),
        successful = result.results.successful,
        failed = result.results.failed,
        "Run complete"
    );
    print_json(&result)
}

/// Connect to the catalog server and load its tools.
async fn connect(config: &AppConfig) -> anyhow::Result<(McpToolProvider, Arc<ToolCatalog>)> {
    let provider = connect_catalog_server(config).await?;
    let catalog = SharedCatalog::new().get_or_load(&provider).await?;
    Ok((provider, catalog))
}

async fn log_events(mut rx: broadcast::Receiver<ExecutionEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "Event logger lagged, skipped events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ExecutionEvent::RunStarted { run_id, mode, steps } => {
                debug!(%run_id, %mode, steps, "run started")
            }
            ExecutionEvent::StepStarted { run_id, tool } => debug!(%run_id, %tool, "step started"),
            ExecutionEvent::StepCompleted { run_id, tool } => {
                debug!(%run_id, %tool, "step completed")
            }
            ExecutionEvent::StepFailed { run_id, tool, error } => {
                debug!(%run_id, %tool, %error, "step failed")
            }
            ExecutionEvent::RunCompleted { run_id, summary } => {
                debug!(%run_id, total = summary.total_executions, "run completed")
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_conflicts_with_mode() {
        let parsed = Cli::try_parse_from(["stepwise", "run", "plan.json", "--sorted", "--mode", "parallel"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from(["stepwise", "run", "plan.json", "--mode", "auto"]).unwrap();
        match cli.command {
            Commands::Run { mode, sorted, .. } => {
                assert_eq!(mode, Some(ModeArg::Auto));
                assert!(!sorted);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["stepwise", "run", "plan.json", "--sorted"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { mode: None, sorted: true, .. }));
    }
}
