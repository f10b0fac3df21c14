mod config;
mod stack;

use clap::{Parser, Subcommand};
use config::MaestroConfig;
use maestro_core::RetryPolicy;
use maestro_gateway::{ApiKeys, GatewayServer};
use maestro_store::AgentRegistry;
use maestro_workflow::InstanceStatus;
use stack::{open_store, Stack};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "maestro.toml";

#[derive(Parser)]
#[command(name = "maestro", about = "Durable multi-agent task orchestration", version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway with the configured agents
    Serve {
        /// Override host
        #[arg(long)]
        host: Option<String>,
        /// Override port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one task in-process and print the outcome
    Run {
        /// Task text handed to the orchestrator
        task: String,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// Inspect the agent registry
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List registered agents
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Run { task, wait_secs } => run_task(config, &task, wait_secs).await,
        Commands::Agents {
            action: AgentsAction::List,
        } => list_agents(&config).await,
    }
}

/// A missing default config means "all defaults"; an explicit path must exist.
async fn load_config(path: &Path) -> anyhow::Result<MaestroConfig> {
    if path == Path::new(DEFAULT_CONFIG) && !tokio::fs::try_exists(path).await? {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(MaestroConfig::default());
    }
    let config = MaestroConfig::load(path).await?;
    info!(path = %path.display(), agents = config.agent.len(), "Configuration loaded");
    Ok(config)
}

async fn serve(
    mut config: MaestroConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(h) = host {
        config.server.host = h;
    }
    if let Some(p) = port {
        config.server.port = p;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let keys = ApiKeys::new(config.server.api_keys.clone());
    if keys.is_enabled() {
        info!(keys = keys.len(), "API key authentication enabled");
    }

    let stack = Stack::start(config).await?;
    let app = GatewayServer::build_with_auth(stack.app_state(), keys);

    info!("Maestro gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    stack.shutdown().await;
    Ok(())
}

async fn run_task(config: MaestroConfig, task: &str, wait_secs: u64) -> anyhow::Result<()> {
    let stack = Stack::start(config).await?;
    let id = stack.engine.start_instance(stack.workflow(), task).await?;
    let inst = stack
        .engine
        .wait_for_completion(&id, Duration::from_secs(wait_secs))
        .await?;
    info!(metrics = %stack.monitor.to_json().await, "Agent metrics");
    stack.shutdown().await;

    match inst.status {
        InstanceStatus::Completed => {
            println!("{}", inst.result.unwrap_or_default());
            Ok(())
        }
        InstanceStatus::Failed => {
            let (code, message) = inst
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_default();
            anyhow::bail!("instance {id} failed: {code}: {message}")
        }
        InstanceStatus::Running => {
            anyhow::bail!("instance {id} still running after {wait_secs}s")
        }
    }
}

async fn list_agents(config: &MaestroConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let registry = AgentRegistry::new(store, RetryPolicy::none());
    let agents = registry.list().await?;
    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    println!("Registered agents:");
    let now = chrono::Utc::now();
    for agent in &agents {
        let stale = agent.is_stale(config.liveness_timeout(), now);
        println!(
            "  {:<20} role={:<12} orchestrator={:<5} topic={}{}",
            agent.name,
            agent.role,
            agent.orchestrator,
            agent.inbound_topic,
            if stale { " (stale)" } else { "" },
        );
    }
    Ok(())
}
