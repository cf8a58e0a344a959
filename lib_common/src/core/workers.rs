//! # Agent Workers
//!
//! The production [`WorkerFactory`]. Which workers exist depends on the
//! node's roles:
//!
//! | name         | role       | runs on                         |
//! |--------------|------------|---------------------------------|
//! | `probe`      | probe      | collector                       |
//! | `normalizer` | normalizer | collector                       |
//! | `admitter`   | admitter   | collector                       |
//! | `transport`  | transport  | transport                       |
//! | `pending`    | transport  | transport                       |
//! | `control`    | control    | every node                      |
//! | `publisher`  | control    | every node                      |
//! | `monitor`    | control    | every node, `control.monitor_files` |
//!
//! Every spawn reads the control plane's current configuration, so a
//! respawned worker picks up a reloaded config.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::supervisor::{WorkerFactory, WorkerSpec};
use super::WorkerRole;
use crate::configs::NodeRole;
use crate::control::{run_change_monitor, run_command_loop, run_publish_loop, ControlPlane, EtcdStore, RemoteStore};
use crate::pipeline::{run_admitter, run_normalizer, run_probe, NormalizerDefaults, PipelineChannels, PluginRegistry};
use crate::queue::BrokerConnector;
use crate::transport::{run_pending_recovery, run_transport, ConsumerGate, SinkFactory};

/// # Agent Workers
pub struct AgentWorkers {
    control: Arc<ControlPlane>,
    connector: Arc<dyn BrokerConnector>,
    sinks: Arc<dyn SinkFactory>,
    registry: PluginRegistry,
    channels: PipelineChannels,
    gate: ConsumerGate,
    remote: Mutex<Option<Arc<dyn RemoteStore>>>,
}

impl AgentWorkers {
    pub fn new(
        control: Arc<ControlPlane>,
        connector: Arc<dyn BrokerConnector>,
        sinks: Arc<dyn SinkFactory>,
        registry: PluginRegistry,
    ) -> Self {
        let config = control.config();
        let channels = PipelineChannels::new(config.pipeline.normalized_capacity);
        let remote = build_remote(&control);
        Self {
            control,
            connector,
            sinks,
            registry,
            channels,
            gate: ConsumerGate::default(),
            remote: Mutex::new(remote),
        }
    }

    /// Replaces the remote store, e.g. with an in-memory one.
    pub fn with_remote(self, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        self.set_remote(remote);
        self
    }

    fn set_remote(&self, remote: Option<Arc<dyn RemoteStore>>) {
        match self.remote.lock() {
            Ok(mut slot) => *slot = remote,
            Err(poisoned) => *poisoned.into_inner() = remote,
        }
    }

    fn remote(&self) -> Option<Arc<dyn RemoteStore>> {
        match self.remote.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The shared pipeline channels, e.g. for feeding raw values by hand.
    pub fn channels(&self) -> &PipelineChannels {
        &self.channels
    }
}

fn build_remote(control: &ControlPlane) -> Option<Arc<dyn RemoteStore>> {
    match EtcdStore::from_config(&control.config().etcd) {
        Ok(remote) => remote,
        Err(e) => {
            error!(error = %e, "remote store unavailable, remote writes disabled");
            None
        }
    }
}

/// A worker that could not be built; it ends at once and is retried on the
/// next supervisor tick.
fn failed(name: &str, reason: String) -> JoinHandle<()> {
    let name = name.to_string();
    tokio::spawn(async move {
        error!(worker = %name, error = %reason, "worker setup failed");
    })
}

#[async_trait]
impl WorkerFactory for AgentWorkers {
    fn roster(&self) -> Vec<WorkerSpec> {
        let config = self.control.config();
        let mut roster = Vec::new();
        if config.runs(NodeRole::Collector) {
            roster.push(WorkerSpec::new("probe", WorkerRole::Probe));
            roster.push(WorkerSpec::new("normalizer", WorkerRole::Normalizer));
            roster.push(WorkerSpec::new("admitter", WorkerRole::Admitter));
        }
        if config.runs(NodeRole::Transport) {
            roster.push(WorkerSpec::new("transport", WorkerRole::Transport));
            roster.push(WorkerSpec::new("pending", WorkerRole::Transport));
        }
        roster.push(WorkerSpec::new("control", WorkerRole::Control));
        roster.push(WorkerSpec::new("publisher", WorkerRole::Control));
        if config.control.monitor_files {
            roster.push(WorkerSpec::new("monitor", WorkerRole::Control));
        }
        roster
    }

    fn spawn(&self, spec: &WorkerSpec, cancel: CancellationToken) -> JoinHandle<()> {
        let config = self.control.config();
        let control = Arc::clone(&self.control);
        let connector = Arc::clone(&self.connector);
        match spec.name.as_str() {
            "probe" => match self.registry.build_probe(&config) {
                Ok(probe) => tokio::spawn(run_probe(
                    probe,
                    self.channels.raw_tx.clone(),
                    Duration::from_secs(config.probe.interval_secs),
                    cancel,
                )),
                Err(e) => failed(&spec.name, e.to_string()),
            },
            "normalizer" => match self.registry.build_normalizer(&config) {
                Ok(normalizer) => tokio::spawn(run_normalizer(
                    normalizer,
                    NormalizerDefaults::from(&config.normalizer),
                    Arc::clone(&self.channels.raw_rx),
                    self.channels.normalized_tx.clone(),
                    cancel,
                )),
                Err(e) => failed(&spec.name, e.to_string()),
            },
            "admitter" => tokio::spawn(run_admitter(
                connector,
                Arc::clone(&self.channels.normalized_rx),
                control,
                Duration::from_secs(config.pipeline.retry_backoff_secs),
                cancel,
            )),
            "transport" => tokio::spawn(run_transport(
                control,
                connector,
                Arc::clone(&self.sinks),
                Arc::clone(&self.gate),
                cancel,
            )),
            "pending" => tokio::spawn(run_pending_recovery(
                control,
                connector,
                Arc::clone(&self.sinks),
                Arc::clone(&self.gate),
                cancel,
            )),
            "control" => tokio::spawn(run_command_loop(control, connector, self.remote(), cancel)),
            "publisher" => tokio::spawn(run_publish_loop(control, connector, self.remote(), cancel)),
            "monitor" => tokio::spawn(run_change_monitor(control, connector, cancel)),
            other => failed(other, "unknown worker".to_string()),
        }
    }

    async fn reload(&self) {
        self.set_remote(build_remote(&self.control));
        info!(remote = self.remote().is_some(), "worker resources rebuilt from reloaded configuration");
    }
}
