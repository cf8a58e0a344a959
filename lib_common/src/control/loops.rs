//! # Control Loops
//!
//! Three independent workers bridging the [`ControlPlane`] to the outside:
//!
//! - **command loop**: polls the broker's command FIFO on a short interval
//!   and acts on `get_status`, `restart`, `reload` and `upload`;
//! - **publish loop**: writes the status snapshot to the remote store and to
//!   the broker's node-status hash on a long interval;
//! - **change monitor**: hashes the modification times of the watched
//!   artifacts and injects a `reload` command when they change.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::remote::{artifact_kind, node_prefix, RemoteError, RemoteStore};
use super::ControlPlane;
use crate::queue::{connect_with_retry, Broker, BrokerConnector, Command};

/// Applies one command.
pub async fn handle_command(
    control: &ControlPlane,
    broker: &dyn Broker,
    remote: Option<&dyn RemoteStore>,
    command: Command,
) {
    info!(worker = "control", command = %command, "command received");
    match command {
        Command::GetStatus => {
            let ttl = Duration::from_secs(control.config().control.status_ttl_secs);
            match serde_json::to_string(&control.snapshot()) {
                Ok(json) => {
                    if let Err(e) = broker.store_local_status(&json, ttl).await {
                        error!(worker = "control", error = %e, "failed to store local status");
                    }
                }
                Err(e) => error!(worker = "control", error = %e, "failed to serialize status"),
            }
        }
        Command::Restart => {
            control.request_restart();
            clear_status(broker).await;
        }
        Command::Reload => {
            match control.reload_config() {
                Ok(_) => control.request_reload(),
                Err(e) => error!(worker = "control", error = %e, "reload rejected, keeping current configuration"),
            }
            clear_status(broker).await;
        }
        Command::Upload => {
            let config = control.config();
            let Some(remote) = remote else {
                warn!(worker = "control", "upload requested but no remote store is configured");
                return;
            };
            let prefix = node_prefix(&config.node, &config.application);
            for path in &config.control.paths {
                match upload(remote, &prefix, path).await {
                    Ok(key) => info!(worker = "control", path = %path.display(), key = %key, "artifact uploaded"),
                    Err(e) => error!(worker = "control", path = %path.display(), error = %e, "artifact upload failed"),
                }
            }
        }
    }
}

async fn clear_status(broker: &dyn Broker) {
    if let Err(e) = broker.clear_local_status().await {
        error!(worker = "control", error = %e, "failed to clear local status");
    }
}

async fn upload(remote: &dyn RemoteStore, prefix: &str, path: &Path) -> Result<String, RemoteError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|source| RemoteError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let key = format!("{}/{}", prefix, artifact_kind(path));
    remote.put(&key, &content).await?;
    Ok(key)
}

/// # Run Command Loop
pub async fn run_command_loop(
    control: Arc<ControlPlane>,
    connector: Arc<dyn BrokerConnector>,
    remote: Option<Arc<dyn RemoteStore>>,
    cancel: CancellationToken,
) {
    let backoff = Duration::from_secs(control.config().redis.retry_backoff_secs);
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "control").await else {
        return;
    };
    let interval = Duration::from_millis(control.config().control.command_interval_ms.max(10));
    info!(worker = "control", "started");

    loop {
        match broker.pop_command().await {
            Ok(Some(raw)) => match Command::parse(&raw) {
                Some(command) => handle_command(&control, broker.as_ref(), remote.as_deref(), command).await,
                None => warn!(worker = "control", command = %raw, "unknown command ignored"),
            },
            Ok(None) => {}
            Err(e) => warn!(worker = "control", error = %e, "command poll failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(worker = "control", "stopped");
}

/// Writes one snapshot to the broker hash and the remote store.
pub async fn publish_status(control: &ControlPlane, broker: &dyn Broker, remote: Option<&dyn RemoteStore>) {
    let config = control.config();
    let json = match serde_json::to_string(&control.snapshot()) {
        Ok(json) => json,
        Err(e) => {
            error!(worker = "publisher", error = %e, "failed to serialize status");
            return;
        }
    };
    if let Err(e) = broker.publish_node_status(&config.node, &json).await {
        warn!(worker = "publisher", error = %e, "node status hash update failed");
    }
    if let Some(remote) = remote {
        let key = format!("{}/status", node_prefix(&config.node, &config.application));
        match remote.put(&key, &json).await {
            Ok(()) => debug!(worker = "publisher", key = %key, "status published"),
            Err(e) => error!(worker = "publisher", key = %key, error = %e, "status publication failed"),
        }
    }
}

/// # Run Publish Loop
pub async fn run_publish_loop(
    control: Arc<ControlPlane>,
    connector: Arc<dyn BrokerConnector>,
    remote: Option<Arc<dyn RemoteStore>>,
    cancel: CancellationToken,
) {
    let backoff = Duration::from_secs(control.config().redis.retry_backoff_secs);
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "publisher").await else {
        return;
    };
    let interval = Duration::from_secs(control.config().control.publish_interval_secs.max(1));
    info!(worker = "publisher", "started");

    loop {
        publish_status(&control, broker.as_ref(), remote.as_deref()).await;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(worker = "publisher", "stopped");
}

/// Hash over the modification times of `paths`. Missing files hash as such,
/// so creating or deleting a watched file also counts as a change.
pub fn fingerprint(paths: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.to_string_lossy().as_bytes());
        let stamp = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().to_string())
            .unwrap_or_else(|| "missing".to_string());
        hasher.update(b":");
        hasher.update(stamp.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// # Run Change Monitor
pub async fn run_change_monitor(
    control: Arc<ControlPlane>,
    connector: Arc<dyn BrokerConnector>,
    cancel: CancellationToken,
) {
    let backoff = Duration::from_secs(control.config().redis.retry_backoff_secs);
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "monitor").await else {
        return;
    };
    let config = control.config();
    let paths = config.control.paths.clone();
    let interval = Duration::from_secs(config.control.monitor_interval_secs.max(1));
    let mut last = fingerprint(&paths);
    info!(worker = "monitor", files = paths.len(), "started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let current = fingerprint(&paths);
        if current == last {
            continue;
        }
        info!(worker = "monitor", "watched files changed, requesting reload");
        match broker.push_command(Command::Reload).await {
            Ok(()) => last = current,
            Err(e) => warn!(worker = "monitor", error = %e, "failed to queue reload, will retry"),
        }
    }
    info!(worker = "monitor", "stopped");
}
