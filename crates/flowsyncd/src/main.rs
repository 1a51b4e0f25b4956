//! Flow-table Synchronization Daemon
//!
//! Main entry point for the flowsyncd daemon.
//! Mirrors kernel neighbor and route events into flow-mods for the flow-table
//! server.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - Configuration file
//! - SI-4: System Monitoring - Real-time event processing

use anyhow::Context;
use clap::Parser;
use flowsyncd::config::DEFAULT_CONFIG_PATH;
use flowsyncd::{
    FlowTable, FlowsyncConfig, MetricsCollector, RedisTransport, start_metrics_server,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Kernel neighbor/route to flow-table synchronization agent
#[derive(Parser, Debug)]
#[command(name = "flowsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error) if RUST_LOG is unset
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // NIST: AU-3, AU-12 - Audit logging setup
    init_logging(&args.log_level);

    info!("flowsyncd: Starting flow-table synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("flowsyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "flowsyncd: Daemon exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Load configuration, wire the synchronizer and run until shutdown
async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let config = FlowsyncConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        agent_id = %format!("{:#x}", config.agent_id),
        interfaces = config.interfaces.len(),
        down_ports = ?config.down_ports,
        "flowsyncd: Configuration loaded"
    );

    let metrics = MetricsCollector::new().context("creating metrics registry")?;
    if config.metrics.enabled {
        let collector = metrics.clone();
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(collector, port).await {
                warn!(error = %e, "flowsyncd: Metrics server stopped");
            }
        });
    }

    let transport = RedisTransport::new(
        &config.transport.redis_host,
        config.transport.redis_port,
        format!("{:x}", config.agent_id),
    )
    .await
    .context("connecting flow-mod transport")?;

    let table = Arc::new(
        FlowTable::new(
            config.agent_id,
            config.interfaces.clone(),
            Arc::new(transport),
            config.down_port_set(),
        )
        .with_resolver(config.gateway_resolver())
        .with_metrics(metrics)
        .with_addressing(&config.transport.channel, &config.transport.server_id),
    );

    // NIST: AC-3 - Kernel subscriptions require CAP_NET_ADMIN
    let workers = table.start().context("subscribing to kernel tables")?;
    info!("flowsyncd: Listening to neighbor and route events...");

    tokio::select! {
        result = workers.wait() => {
            result.context("event worker stopped")?;
        }
        _ = signal::ctrl_c() => {
            info!("flowsyncd: Received SIGINT, shutting down");
        }
    }

    info!("flowsyncd: Graceful shutdown complete");
    Ok(())
}
