//! # Transport Workers
//!
//! `run_transport` is the main delivery loop. `run_pending_recovery` sweeps
//! entries that were delivered to this consumer but never acknowledged.
//!
//! Both workers of one consumer share a [`ConsumerGate`]: the sweep never
//! runs while an entry is between fetch and ack, so an acknowledged entry
//! cannot be picked up again by the sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SinkAdapter, SinkFactory};
use crate::control::ControlPlane;
use crate::queue::{connect_with_retry, unpack, Broker, BrokerConnector, QueueEntry, QueueError};

/// Serializes delivery and pending recovery for one consumer.
pub type ConsumerGate = Arc<Mutex<()>>;

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Written to the sink and acknowledged.
    Delivered,
    /// Rejected by the sink and acknowledged anyway.
    Dropped,
    /// Left pending for a later sweep.
    Retained,
}

/// Unpacks, shapes, sends and acknowledges a single entry.
pub async fn process_entry(
    broker: &dyn Broker,
    sink: &mut dyn SinkAdapter,
    group: &str,
    entry: &QueueEntry,
) -> Outcome {
    let record = match unpack(&entry.payload) {
        Ok(record) => record,
        Err(e) => {
            warn!(worker = "transport", id = %entry.id, error = %e, "malformed entry left pending");
            return Outcome::Retained;
        }
    };

    let sent = match sink.shape(&record) {
        Ok(shaped) => sink.send(shaped).await,
        Err(e) => Err(e),
    };
    let outcome = match sent {
        Ok(()) => Outcome::Delivered,
        Err(e) if e.is_policy_drop() => {
            warn!(
                worker = "transport",
                id = %entry.id,
                table = %record.destination_table,
                error = %e,
                "record dropped by sink policy"
            );
            Outcome::Dropped
        }
        Err(e) => {
            error!(
                worker = "transport",
                id = %entry.id,
                table = %record.destination_table,
                error = %e,
                "delivery failed, entry left pending"
            );
            return Outcome::Retained;
        }
    };

    if let Err(e) = broker.ack(group, &entry.id).await {
        warn!(worker = "transport", id = %entry.id, error = %e, "ack failed, entry will be redelivered");
        return Outcome::Retained;
    }
    debug!(worker = "transport", id = %entry.id, outcome = ?outcome, "entry settled");
    outcome
}

async fn build_sink_with_retry(
    sinks: &dyn SinkFactory,
    control: &ControlPlane,
    backoff: Duration,
    cancel: &CancellationToken,
    worker: &str,
) -> Option<Box<dyn SinkAdapter>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let config = control.config();
        match sinks.build(&config, worker).await {
            Ok(sink) => {
                info!(worker, sink = %sink.kind(), "sink ready");
                return Some(sink);
            }
            Err(e) => {
                error!(worker, sink = %config.send_to_where, error = %e, "sink setup failed, retrying in {:?}", backoff);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

async fn ensure_group(broker: &dyn Broker, group: &str, worker: &str) {
    match broker.ensure_group(group).await {
        Ok(()) => debug!(worker, group, "consumer group ready"),
        Err(e) => warn!(worker, group, error = %e, "consumer group setup failed"),
    }
}

/// Runs one pending-recovery sweep. Returns how many entries were settled.
pub async fn sweep_pending(
    broker: &dyn Broker,
    sink: &mut dyn SinkAdapter,
    group: &str,
    consumer: &str,
) -> Result<usize, QueueError> {
    let entries = broker.recover_pending(group, consumer).await?;
    let mut settled = 0;
    for entry in &entries {
        if process_entry(broker, sink, group, entry).await != Outcome::Retained {
            settled += 1;
        }
    }
    if !entries.is_empty() {
        info!(worker = "pending", found = entries.len(), settled, "pending entries swept");
    }
    Ok(settled)
}

/// # Run Transport
///
/// Startup: connect, build the sink, make sure the group exists and sweep
/// whatever this consumer left pending last time. Then one entry per cycle
/// until cancelled.
pub async fn run_transport(
    control: Arc<ControlPlane>,
    connector: Arc<dyn BrokerConnector>,
    sinks: Arc<dyn SinkFactory>,
    gate: ConsumerGate,
    cancel: CancellationToken,
) {
    let config = control.config();
    let backoff = Duration::from_secs(config.pipeline.retry_backoff_secs);
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "transport").await else {
        return;
    };
    let Some(mut sink) = build_sink_with_retry(sinks.as_ref(), &control, backoff, &cancel, "transport").await else {
        return;
    };
    let stream = config.stream.clone();
    ensure_group(broker.as_ref(), &stream.group, "transport").await;
    {
        let _turn = gate.lock().await;
        if let Err(e) = sweep_pending(broker.as_ref(), sink.as_mut(), &stream.group, &stream.consumer).await {
            warn!(worker = "transport", error = %e, "startup pending sweep failed");
        }
    }
    info!(worker = "transport", group = %stream.group, consumer = %stream.consumer, "started");

    loop {
        let cycle = async {
            let _turn = gate.lock().await;
            match broker.consume(&stream.group, &stream.consumer, stream.block()).await {
                Ok(Some(entry)) => {
                    process_entry(broker.as_ref(), sink.as_mut(), &stream.group, &entry).await;
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = cycle => result,
        };
        match result {
            Ok(()) => {}
            Err(QueueError::GroupMissing { stream: key, group }) => {
                warn!(worker = "transport", stream = %key, group = %group, "consumer group missing, recreating");
                ensure_group(broker.as_ref(), &group, "transport").await;
            }
            Err(e) => {
                warn!(worker = "transport", error = %e, "fetch failed, retrying in {:?}", backoff);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    info!(worker = "transport", "stopped");
}

/// # Run Pending Recovery
pub async fn run_pending_recovery(
    control: Arc<ControlPlane>,
    connector: Arc<dyn BrokerConnector>,
    sinks: Arc<dyn SinkFactory>,
    gate: ConsumerGate,
    cancel: CancellationToken,
) {
    let config = control.config();
    let backoff = Duration::from_secs(config.pipeline.retry_backoff_secs);
    let interval = Duration::from_secs(config.pipeline.pending_interval_secs.max(1));
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "pending").await else {
        return;
    };
    let Some(mut sink) = build_sink_with_retry(sinks.as_ref(), &control, backoff, &cancel, "pending").await else {
        return;
    };
    let stream = config.stream.clone();
    info!(worker = "pending", interval = ?interval, "started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let sweep = async {
            let _turn = gate.lock().await;
            sweep_pending(broker.as_ref(), sink.as_mut(), &stream.group, &stream.consumer).await
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = sweep => result,
        };
        match result {
            Ok(_) => {}
            Err(QueueError::GroupMissing { group, .. }) => ensure_group(broker.as_ref(), &group, "pending").await,
            Err(e) => warn!(worker = "pending", error = %e, "pending sweep failed"),
        }
    }
    info!(worker = "pending", "stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{AgentConfig, SinkKind};
    use crate::queue::{MemoryBroker, ReliableQueue};
    use crate::record::{CanonicalRecord, TimestampUnit};
    use crate::transport::{SinkError, Shaped};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    /// Pops one scripted result per send; succeeds once the script runs out.
    #[derive(Clone, Default)]
    struct ScriptedSink {
        script: Arc<StdMutex<Vec<Result<(), SinkError>>>>,
        delivered: Arc<StdMutex<Vec<i64>>>,
    }

    #[async_trait]
    impl SinkAdapter for ScriptedSink {
        fn kind(&self) -> SinkKind {
            SinkKind::Relational
        }

        async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError> {
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() { Ok(()) } else { script.remove(0) }
            };
            if next.is_ok() {
                if let Shaped::Row(record) = shaped {
                    self.delivered.lock().unwrap().push(record.timestamp);
                }
            }
            next
        }
    }

    #[async_trait]
    impl SinkFactory for ScriptedSink {
        async fn build(&self, _config: &AgentConfig, _worker: &str) -> Result<Box<dyn SinkAdapter>, SinkError> {
            Ok(Box::new(self.clone()))
        }
    }

    fn record(ts: i64) -> CanonicalRecord {
        let fields = [("v".to_string(), serde_json::Value::from(ts))].into_iter().collect();
        CanonicalRecord::new("t", fields, BTreeMap::new(), TimestampUnit::Seconds, ts).unwrap()
    }

    async fn consume_one(broker: &MemoryBroker) -> QueueEntry {
        broker.consume("g", "c", Duration::ZERO).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn rejected_records_are_acknowledged() {
        let broker = MemoryBroker::default();
        broker.ensure_group("g").await.unwrap();
        broker.admit(&record(1)).await.unwrap();
        let mut sink = ScriptedSink::default();
        sink.script.lock().unwrap().push(Err(SinkError::Rejected("beyond retention policy".into())));

        let entry = consume_one(&broker).await;
        assert_eq!(process_entry(&broker, &mut sink, "g", &entry).await, Outcome::Dropped);
        assert_eq!(broker.pending_count("g"), 0);
        assert!(broker.recover_pending("g", "c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failures_stay_pending_and_are_swept() {
        let broker = MemoryBroker::default();
        broker.ensure_group("g").await.unwrap();
        broker.admit(&record(1)).await.unwrap();
        let mut sink = ScriptedSink::default();
        sink.script.lock().unwrap().push(Err(SinkError::Transport("connection reset".into())));

        let entry = consume_one(&broker).await;
        assert_eq!(process_entry(&broker, &mut sink, "g", &entry).await, Outcome::Retained);
        assert_eq!(broker.pending_count("g"), 1);

        assert_eq!(sweep_pending(&broker, &mut sink, "g", "c").await.unwrap(), 1);
        assert_eq!(broker.pending_count("g"), 0);
        assert_eq!(*sink.delivered.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn malformed_entries_are_never_acknowledged() {
        let broker = MemoryBroker::default();
        let mut sink = ScriptedSink::default();
        let entry = QueueEntry {
            id: "1-0".to_string(),
            payload: vec![0xc1, 0x00],
        };
        assert_eq!(process_entry(&broker, &mut sink, "g", &entry).await, Outcome::Retained);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_delivers_and_recreates_a_lost_group() {
        let broker = MemoryBroker::default();
        let mut config = AgentConfig::default();
        config.stream.group = "g".to_string();
        config.stream.consumer = "c".to_string();
        config.stream.block_ms = 20;
        config.pipeline.retry_backoff_secs = 0;
        let control = ControlPlane::with_config(config);
        let sink = ScriptedSink::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_transport(
            control,
            Arc::new(broker.clone()),
            Arc::new(sink.clone()),
            ConsumerGate::default(),
            cancel.clone(),
        ));

        broker.admit(&record(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.drop_groups();
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.admit(&record(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        cancel.cancel();
        handle.await.unwrap();
        let delivered = sink.delivered.lock().unwrap().clone();
        assert!(delivered.contains(&1));
        assert!(delivered.contains(&2));
        assert_eq!(broker.pending_count("g"), 0);
    }
}
