/// # Control Integration Tests
///
/// Sends commands through the broker's command FIFO to a supervised node and
/// checks what the control plane makes of them:
/// 1.  `reload` re-reads the configuration file and restarts every worker
///     without counting restarts.
/// 2.  `restart` counts exactly one restart per worker.
/// 3.  `get_status` answers through the local status cache, and the
///     publisher writes the node's entry into the status hash.
/// 4.  The log ring keeps only the most recent lines.
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lib_common::configs::{ConfigSource, NodeRole};
use lib_common::control::ControlPlane;
use lib_common::core::{AgentWorkers, Supervisor, WorkerRole};
use lib_common::loggers::{LogEntry, LogRing, LOG_RING_CAPACITY};
use lib_common::queue::{Command, ControlChannel, MemoryBroker};
use project_tests::{fast_config, registry, wait_until, wait_until_async, CollectingSink};
use serde_json::Value;
use tempfile::tempdir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PATIENCE: Duration = Duration::from_secs(5);

struct Node {
    control: Arc<ControlPlane>,
    broker: MemoryBroker,
    root: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl Node {
    fn start(control: Arc<ControlPlane>) -> Self {
        let broker = MemoryBroker::default();
        let workers = AgentWorkers::new(
            control.clone(),
            Arc::new(broker.clone()),
            Arc::new(CollectingSink::default()),
            registry(),
        );
        let root = CancellationToken::new();
        let supervisor = Supervisor::new(control.clone(), Arc::new(workers), root.clone())
            .with_interval(Duration::from_millis(50));
        let supervisor = tokio::spawn(supervisor.run(root.clone()));
        Self {
            control,
            broker,
            root,
            supervisor,
        }
    }

    fn live(&self, names: &[&str]) -> bool {
        let live = self.control.snapshot().live_worker_names;
        names.iter().all(|name| live.contains(*name))
    }

    async fn stop(self) {
        self.root.cancel();
        self.supervisor.await.unwrap();
    }
}

const COLLECTOR_WORKERS: [&str; 5] = ["probe", "normalizer", "admitter", "control", "publisher"];

fn write_config(path: &Path, node: &str) {
    let body = format!(
        "node = \"{}\"\nroles = [\"collector\"]\n\n[probe]\nkind = \"idle\"\n\n[control]\ncommand_interval_ms = 10\npublish_interval_secs = 1\n",
        node
    );
    fs::write(path, body).unwrap();
}

#[tokio::test]
async fn reload_applies_the_new_file_without_counting_restarts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agent.toml");
    write_config(&path, "before");
    let source = ConfigSource::File(path.clone());
    let config = source.load().unwrap();
    let node = Node::start(ControlPlane::new(source, config, LogRing::default()));
    assert!(wait_until(PATIENCE, || node.live(&COLLECTOR_WORKERS)).await);

    write_config(&path, "after");
    node.broker.push_command(Command::Reload).await.unwrap();

    assert!(wait_until(PATIENCE, || node.control.config().node == "after" && !node.control.reload_pending()).await);
    assert!(wait_until(PATIENCE, || node.live(&COLLECTOR_WORKERS)).await);
    // The respawned publisher reports under the new node id.
    let broker = &node.broker;
    assert!(wait_until_async(PATIENCE, || async move { broker.node_statuses().await.unwrap().contains_key("after") }).await);
    for role in [WorkerRole::Probe, WorkerRole::Normalizer, WorkerRole::Admitter, WorkerRole::Control] {
        assert_eq!(node.control.restart_count(role), 0, "{} counted a restart", role);
    }
    node.stop().await;
}

#[tokio::test]
async fn invalid_reload_keeps_the_running_configuration() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agent.toml");
    write_config(&path, "steady");
    let source = ConfigSource::File(path.clone());
    let config = source.load().unwrap();
    let node = Node::start(ControlPlane::new(source, config, LogRing::default()));

    fs::write(&path, "node = [not toml").unwrap();
    node.broker.push_command(Command::Reload).await.unwrap();
    assert!(wait_until(PATIENCE, || node.broker.command_backlog() == 0).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(node.control.config().node, "steady");
    assert!(!node.control.reload_pending());
    node.stop().await;
}

#[tokio::test]
async fn restart_counts_each_worker_once() {
    let node = Node::start(ControlPlane::with_config(fast_config("edge-1", vec![NodeRole::Collector])));
    assert!(wait_until(PATIENCE, || node.live(&COLLECTOR_WORKERS)).await);

    node.broker.push_command(Command::Restart).await.unwrap();
    assert!(wait_until(PATIENCE, || node.control.restart_count(WorkerRole::Probe) == 1).await);
    assert!(wait_until(PATIENCE, || node.live(&COLLECTOR_WORKERS)).await);

    // Several more ticks must not count the respawn a second time.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node.control.restart_count(WorkerRole::Probe), 1);
    assert_eq!(node.control.restart_count(WorkerRole::Admitter), 1);
    assert_eq!(node.control.restart_count(WorkerRole::Control), 2);
    assert_eq!(node.control.restart_count(WorkerRole::Transport), 0);
    node.stop().await;
}

#[tokio::test]
async fn status_is_served_through_the_cache_and_the_node_hash() {
    let control = ControlPlane::with_config(fast_config("edge-9", vec![NodeRole::Collector]));
    control.enqueue_log("info", "probe attached");
    let node = Node::start(control);

    node.broker.push_command(Command::GetStatus).await.unwrap();
    let broker = &node.broker;
    assert!(wait_until_async(PATIENCE, || async move { broker.load_local_status().await.unwrap().is_some() }).await);

    let raw = node.broker.load_local_status().await.unwrap().unwrap();
    let status: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(status["node_id"], "edge-9");
    assert!(status["restart_counts_by_role"].is_object());
    let lines = status["recent_log_ring"].as_array().unwrap();
    assert!(lines.iter().any(|line| line["message"] == "probe attached"));

    assert!(wait_until_async(PATIENCE, || async move { broker.node_statuses().await.unwrap().contains_key("edge-9") }).await);
    node.stop().await;
}

#[tokio::test]
async fn log_ring_keeps_the_most_recent_lines() {
    let ring = LogRing::default();
    let control = ControlPlane::new(
        ConfigSource::Fixed(Box::new(fast_config("edge-1", vec![NodeRole::Collector]))),
        fast_config("edge-1", vec![NodeRole::Collector]),
        ring.clone(),
    );
    for i in 0..LOG_RING_CAPACITY + 5 {
        control.enqueue_log("warn", format!("line {}", i));
    }
    ring.push(LogEntry::new("error", "test", "last"));

    let lines = control.snapshot().recent_log_ring;
    assert_eq!(lines.len(), LOG_RING_CAPACITY);
    assert_eq!(lines.first().unwrap().message, format!("line {}", 6));
    assert_eq!(lines.last().unwrap().message, "last");
}
