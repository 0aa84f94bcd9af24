//! `maestro` — orchestration engine daemon.

use clap::{Parser, Subcommand};
use maestro_engine::{EngineConfig, NoopExecutor, Orchestrator, TaskEventHandler};
use maestro_gateway::{GatewayServer, IntegrationAuth};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — task & pipeline orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook gateway and background sweeps
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Parse and validate the config file, then exit
    Check,
}

#[derive(Deserialize)]
struct MaestroConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    sweeps: SweepConfig,
    #[serde(default)]
    integrations: Vec<IntegrationEntry>,
}

#[derive(Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Deserialize)]
struct SweepConfig {
    /// How often due event retries are re-submitted.
    #[serde(default = "default_retry_seconds")]
    event_retry_seconds: u64,
    /// How often the timeout watchdog runs.
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
    /// How often pipeline statistics are refreshed.
    #[serde(default = "default_stats_seconds")]
    stats_seconds: u64,
    /// How often the notification sink is drained.
    #[serde(default = "default_notify_seconds")]
    notify_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            event_retry_seconds: default_retry_seconds(),
            timeout_seconds: default_timeout_seconds(),
            stats_seconds: default_stats_seconds(),
            notify_seconds: default_notify_seconds(),
        }
    }
}

#[derive(Deserialize)]
struct IntegrationEntry {
    id: Uuid,
    tenant_id: Uuid,
    secret: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_retry_seconds() -> u64 {
    30
}
fn default_timeout_seconds() -> u64 {
    60
}
fn default_stats_seconds() -> u64 {
    300
}
fn default_notify_seconds() -> u64 {
    15
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

    let config_str = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            cli.config.display(),
            e
        )
    })?;
    let config: MaestroConfig = toml::from_str(&config_str)?;

    match cli.command {
        Commands::Check => {
            info!(
                integrations = config.integrations.len(),
                "config parsed successfully"
            );
            Ok(())
        }
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);
            serve(config.engine, config.sweeps, config.integrations, host, port).await
        }
    }
}

async fn serve(
    engine_config: EngineConfig,
    sweeps: SweepConfig,
    integrations: Vec<IntegrationEntry>,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    info!("Starting Maestro gateway on {}:{}", host, port);

    // The execution engine is an external collaborator; without one
    // configured, dispatched work is echoed back as completed.
    let engine = Arc::new(Orchestrator::new(engine_config, Arc::new(NoopExecutor)));
    info!("agent executor: noop (external engine not configured)");

    engine
        .register_handler(
            "tasks",
            Arc::new(TaskEventHandler::new(engine.tasks().clone())),
        )
        .await;

    let integrations: HashMap<Uuid, IntegrationAuth> = integrations
        .into_iter()
        .map(|entry| {
            (
                entry.id,
                IntegrationAuth {
                    tenant_id: entry.tenant_id,
                    secret: entry.secret,
                },
            )
        })
        .collect();
    info!(count = integrations.len(), "integrations configured");

    let app = GatewayServer::build(engine.clone(), integrations);

    // Retry sweep: re-submit events whose backoff elapsed.
    let retry_engine = engine.clone();
    let retry_interval = Duration::from_secs(sweeps.event_retry_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(retry_interval);
        loop {
            ticker.tick().await;
            let due = retry_engine.sweep_event_retries().await;
            if !due.is_empty() {
                info!(count = due.len(), "re-submitted due event retries");
            }
        }
    });

    // Timeout watchdog for executions and agent tasks.
    let watchdog_engine = engine.clone();
    let watchdog_interval = Duration::from_secs(sweeps.timeout_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(watchdog_interval);
        loop {
            ticker.tick().await;
            let executions = watchdog_engine.sweep_execution_timeouts().await;
            let agent_tasks = watchdog_engine.sweep_agent_timeouts().await;
            if !executions.is_empty() || !agent_tasks.is_empty() {
                info!(
                    executions = executions.len(),
                    agent_tasks = agent_tasks.len(),
                    "timed out stale work"
                );
            }
        }
    });

    // Periodic statistics refresh.
    let stats_engine = engine.clone();
    let stats_interval = Duration::from_secs(sweeps.stats_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_interval);
        loop {
            ticker.tick().await;
            stats_engine.refresh_all_pipeline_stats().await;
        }
    });

    // Drain notification records. Delivery is an external concern; the
    // daemon logs each record as a stand-in sink.
    let notify_engine = engine.clone();
    let notify_interval = Duration::from_secs(sweeps.notify_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(notify_interval);
        loop {
            ticker.tick().await;
            for record in notify_engine.notifications().drain().await {
                info!(
                    kind = ?record.kind,
                    target = %record.target_config,
                    triggered_at = %record.triggered_at,
                    "notification record"
                );
            }
        }
    });

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
