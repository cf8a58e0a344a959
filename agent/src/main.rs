//! # Telemetry Agent
//!
//! One process of the distributed telemetry agent. Depending on its roles a
//! node collects readings into the reliable queue, fans queued records out
//! to the configured sink, or both. Every node runs the control loops and,
//! unless disabled, the HTTP control API.
//!
//! ## Startup
//! 1. Parse the command line and load `--config` (TOML).
//! 2. Validate it; missing sink credentials stop the process here.
//! 3. Install logging (console, optional daily JSON file, log ring).
//! 4. Build the control plane, the worker roster and the supervisor.
//! 5. Serve the HTTP API and wait for Ctrl-C or SIGTERM.

mod http_api;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lib_common::configs::ConfigSource;
use lib_common::control::ControlPlane;
use lib_common::core::{AgentWorkers, Supervisor};
use lib_common::loggers::{LogRing, setup_logging};
use lib_common::pipeline::PluginRegistry;
use lib_common::queue::{BrokerConnector, MemoryBroker, RedisConnector};
use lib_common::sinks::ConfiguredSinks;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// # Command Line
#[derive(Parser, Debug)]
#[clap(author, version, about = "Telemetry collection agent.")]
#[clap(long_about = None)]
struct Args {
    /// Path of the TOML configuration file.
    #[clap(long, env = "AGENT_CONFIG", default_value = "agent.toml")]
    config: PathBuf,

    /// Node id, overriding `node` from the file.
    #[clap(long, env = "AGENT_NODE")]
    node: Option<String>,

    /// Log level or filter directive, overriding `[log].level`.
    #[clap(long, env = "AGENT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Run against an in-process broker instead of Redis (single node).
    #[clap(long)]
    memory_broker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut source = ConfigSource::File(args.config.clone());
    if let Some(node) = &args.node {
        source = source.with_node(node.clone());
    }
    let config = source
        .load()
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    let ring = LogRing::default();
    let _log_guard = setup_logging(&config.log, args.log_level.as_deref(), ring.clone())
        .context("failed to initialize logging")?;
    info!(
        node = %config.node,
        roles = ?config.roles,
        sink = %config.send_to_where,
        memory_broker = args.memory_broker,
        "agent starting"
    );

    let connector: Arc<dyn BrokerConnector> = if args.memory_broker {
        Arc::new(MemoryBroker::new(config.stream.clone()))
    } else {
        Arc::new(RedisConnector {
            redis: config.redis.clone(),
            stream: config.stream.clone(),
        })
    };

    let http_enabled = config.http.enabled;
    let control = ControlPlane::new(source, config, ring);
    let root = CancellationToken::new();
    let workers = AgentWorkers::new(
        control.clone(),
        connector.clone(),
        Arc::new(ConfiguredSinks),
        PluginRegistry::default(),
    );
    let supervisor = Supervisor::new(control.clone(), Arc::new(workers), root.clone());
    let supervisor_task = tokio::spawn(supervisor.run(root.clone()));

    let http_task = http_enabled.then(|| tokio::spawn(http_api::run(control.clone(), connector, root.clone())));

    shutdown_signal().await;
    info!("shutdown signal received");
    root.cancel();

    if let Err(e) = supervisor_task.await {
        error!(error = %e, "supervisor task failed");
    }
    if let Some(task) = http_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP API ended with an error"),
            Err(e) => error!(error = %e, "HTTP API task failed"),
        }
    }
    info!("agent stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
