//! # Project Tests
//!
//! Fixtures shared by the cross-module tests under `tests/`. Everything runs
//! against the in-process broker, so no Redis or sink backend is needed.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lib_common::configs::{AgentConfig, NodeRole, SinkKind};
use lib_common::pipeline::{PluginRegistry, Probe, ProbeError, Readings};
use lib_common::record::{CanonicalRecord, TimestampUnit};
use lib_common::transport::{SinkAdapter, SinkError, SinkFactory, Shaped};

/// # Collecting Sink
///
/// A relational-kind sink that keeps every delivered record in memory.
/// Failures queued with [`CollectingSink::fail_next`] are returned by the
/// next sends, in order. Clones share their state.
#[derive(Clone, Default)]
pub struct CollectingSink {
    script: Arc<Mutex<VecDeque<SinkError>>>,
    delivered: Arc<Mutex<Vec<CanonicalRecord>>>,
    attempts: Arc<AtomicUsize>,
}

impl CollectingSink {
    pub fn fail_next(&self, error: SinkError) {
        self.script.lock().unwrap().push_back(error);
    }

    pub fn delivered(&self) -> Vec<CanonicalRecord> {
        self.delivered.lock().unwrap().clone()
    }

    /// Sends attempted so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkAdapter for CollectingSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Relational
    }

    async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.script.lock().unwrap().pop_front() {
            return Err(error);
        }
        match shaped {
            Shaped::Row(record) => {
                self.delivered.lock().unwrap().push(record);
                Ok(())
            }
            other => Err(SinkError::Shape(format!("unexpected shape {:?}", other))),
        }
    }
}

#[async_trait]
impl SinkFactory for CollectingSink {
    async fn build(&self, _config: &AgentConfig, _worker: &str) -> Result<Box<dyn SinkAdapter>, SinkError> {
        Ok(Box::new(self.clone()))
    }
}

/// A probe that never reads anything; tests feed the raw channel directly.
pub struct IdleProbe;

#[async_trait]
impl Probe for IdleProbe {
    async fn produce(&mut self) -> Result<Readings, ProbeError> {
        Ok(Readings::Many(Vec::new()))
    }
}

/// The default registry plus the `idle` probe kind.
pub fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::default();
    registry.register_probe("idle", |_| Ok(Box::new(IdleProbe) as Box<dyn Probe>));
    registry
}

/// A configuration with short intervals, suitable for driving workers in
/// tests.
pub fn fast_config(node: &str, roles: Vec<NodeRole>) -> AgentConfig {
    let mut config = AgentConfig {
        node: node.to_string(),
        roles,
        ..AgentConfig::default()
    };
    config.probe.kind = "idle".to_string();
    config.stream.block_ms = 20;
    config.pipeline.retry_backoff_secs = 0;
    config.pipeline.pending_interval_secs = 1;
    config.control.command_interval_ms = 10;
    config.control.publish_interval_secs = 1;
    config.supervisor.join_timeout_secs = 2;
    config
}

pub fn record(table: &str, timestamp: i64) -> CanonicalRecord {
    let fields = BTreeMap::from([("value".to_string(), serde_json::Value::from(timestamp))]);
    let tags = BTreeMap::from([("site".to_string(), "lab".to_string())]);
    CanonicalRecord::new(table, fields, tags, TimestampUnit::Seconds, timestamp).unwrap()
}

/// Polls `check` every 20 ms; `false` once `timeout` elapses first.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Async flavour of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
