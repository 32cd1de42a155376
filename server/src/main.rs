#![deny(clippy::unwrap_used)]

mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crudapp_cluster::{
    inventory_from_config, AssumeLeaderProbe, ClusterManager, ConnectionReport, Discovery,
    HttpLeaderProbe, LeaderProbe, MemberAddress,
};
use serde::Serialize;
use settings::Settings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "crudapp-server")]
#[command(about = "Keeps the CRUD app connected to the writable PostgreSQL cluster member")]
#[command(version)]
struct Args {
    /// Settings file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Connect to the leader and keep following it until interrupted
    Run,
    /// Connect once and print the connection report and pool statistics
    Status,
    /// Discover members and probe each one for leadership
    Members,
}

#[derive(Serialize)]
struct MemberStatus {
    member: MemberAddress,
    leader: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_tracing(args.log_level.as_deref());

    if let Err(e) = run_command(args).await {
        error!(error = %format!("{:#}", e), "crudapp-server failed");
        std::process::exit(1);
    }
}

fn init_tracing(level: Option<&str>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // stdout is reserved for command output
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    metrics::describe_counter!(
        "crudapp_cluster_discovery_total",
        "Discovery runs by outcome"
    );
    metrics::describe_gauge!(
        "crudapp_cluster_members",
        "Members in the last successful discovery"
    );
    metrics::describe_counter!(
        "crudapp_cluster_connect_attempts_total",
        "Leader connection attempts by outcome"
    );
    metrics::describe_counter!(
        "crudapp_cluster_reconnections_total",
        "Completed reconnections by outcome"
    );
    metrics::describe_counter!(
        "crudapp_cluster_leader_changes_total",
        "Times the active member changed"
    );
    metrics::describe_histogram!(
        "crudapp_cluster_query_duration_seconds",
        "Duration of successful queries"
    );
    metrics::describe_counter!(
        "crudapp_cluster_query_errors_total",
        "Failed queries by error kind"
    );

    info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

async fn run_command(args: Args) -> Result<()> {
    let settings = Settings::load(args.config.as_deref())?;
    info!(
        mode = settings.mode(),
        url = ?settings.database_url.as_deref().map(redact),
        "Settings loaded"
    );

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&settings, args.metrics_addr).await,
        Command::Status => status(&settings).await,
        Command::Members => members(&settings).await,
    }
}

fn redact(url: &str) -> String {
    crudapp_common::ConnectionUrl::parse(url)
        .map(|u| u.redacted())
        .unwrap_or_else(|_| "<invalid>".to_string())
}

async fn run(settings: &Settings, metrics_addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = metrics_addr {
        init_metrics(addr)?;
    }

    let manager = ClusterManager::from_config(settings.cluster_config()?)?;
    manager
        .initialize()
        .await
        .context("failed to initialize database connection")?;

    let stats = manager.stats();
    info!(
        state = %stats.state,
        member = ?stats.active_member,
        members = stats.directory_size,
        max_connections = stats.pool.max_connections,
        health_check_interval_ms = manager.config().health_check_interval_ms,
        discovery_interval_ms = manager.config().discovery_interval_ms,
        "Database connection ready"
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    manager.shutdown().await;
    info!(reconnections = manager.stats().reconnections, "Shutdown complete");
    Ok(())
}

async fn status(settings: &Settings) -> Result<()> {
    let manager = ClusterManager::from_config(settings.cluster_config()?)?;
    let initialized = manager.initialize().await;

    let report = match &initialized {
        Ok(()) => manager.test_connection().await,
        Err(e) => ConnectionReport::failed(e.to_string(), None, manager.directory().members().to_vec()),
    };
    let stats = manager.stats();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "connection": report,
            "stats": stats,
        }))?
    );

    manager.shutdown().await;
    initialized.context("database connection failed")?;
    Ok(())
}

async fn members(settings: &Settings) -> Result<()> {
    let config = settings.cluster_config()?;
    let discovery = Discovery::new(inventory_from_config(&config));
    let probe: Arc<dyn LeaderProbe> = if config.verify_leader {
        Arc::new(HttpLeaderProbe::from_config(&config)?)
    } else {
        Arc::new(AssumeLeaderProbe)
    };

    let directory = discovery.discover().await;
    if directory.is_empty() {
        warn!("No database instances found");
    }

    let mut statuses = Vec::with_capacity(directory.len());
    for member in directory.iter() {
        statuses.push(MemberStatus {
            member: member.clone(),
            leader: probe.is_leader(member).await,
        });
    }

    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
