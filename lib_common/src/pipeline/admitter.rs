//! # Admitter
//!
//! Moves normalized records into the reliable queue. A failed admission is
//! logged and the record dropped: before admission nothing is durable yet,
//! so the edge of the pipeline is at-most-once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::control::ControlPlane;
use crate::queue::{connect_with_retry, Admission, BrokerConnector};
use crate::record::CanonicalRecord;

/// # Run Admitter
pub async fn run_admitter(
    connector: Arc<dyn BrokerConnector>,
    normalized_rx: Arc<Mutex<mpsc::Receiver<CanonicalRecord>>>,
    control: Arc<ControlPlane>,
    backoff: Duration,
    cancel: CancellationToken,
) {
    let Some(broker) = connect_with_retry(connector.as_ref(), backoff, &cancel, "admitter").await else {
        return;
    };
    let verbose = control.config().pipeline.enqueue_log;
    info!(worker = "admitter", "started");

    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = async { normalized_rx.lock().await.recv().await } => record,
        };
        let Some(record) = record else {
            error!(worker = "admitter", "normalized channel closed");
            break;
        };

        match broker.admit(&record).await {
            Ok(Admission::Admitted(id)) => {
                if verbose {
                    info!(worker = "admitter", id = %id, table = %record.destination_table, "record admitted");
                } else {
                    debug!(worker = "admitter", id = %id, table = %record.destination_table, "record admitted");
                }
                control.record_data(&record);
            }
            Ok(Admission::Duplicate) => {
                info!(
                    worker = "admitter",
                    table = %record.destination_table,
                    timestamp = record.timestamp,
                    "record identical to the previous one for its table, skipped"
                );
                control.record_duplicate(&record);
            }
            Err(e) => {
                error!(
                    worker = "admitter",
                    table = %record.destination_table,
                    error = %e,
                    "admission failed, record dropped"
                );
            }
        }
    }
    info!(worker = "admitter", "stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::AgentConfig;
    use crate::queue::{MemoryBroker, ReliableQueue};
    use crate::record::TimestampUnit;
    use std::collections::BTreeMap;

    fn record(v: i64) -> CanonicalRecord {
        let fields = [("v".to_string(), serde_json::Value::from(v))].into_iter().collect();
        CanonicalRecord::new("t", fields, BTreeMap::new(), TimestampUnit::Seconds, v).unwrap()
    }

    #[tokio::test]
    async fn admits_records_and_drops_on_broker_failure() {
        let broker = MemoryBroker::default();
        let control = ControlPlane::with_config(AgentConfig::default());
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_admitter(
            Arc::new(broker.clone()),
            Arc::new(Mutex::new(rx)),
            control.clone(),
            Duration::from_millis(5),
            cancel.clone(),
        ));

        tx.send(record(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.stream_len(), 1);
        assert!(control.snapshot().last_known_data.contains_key("t"));

        broker.set_offline(true);
        tx.send(record(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.set_offline(false);
        tx.send(record(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();

        broker.ensure_group("g").await.unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = broker.consume("g", "c", Duration::ZERO).await.unwrap() {
            seen.push(crate::queue::unpack(&entry.payload).unwrap().timestamp);
        }
        assert_eq!(seen, vec![1, 3]);
    }

    #[tokio::test]
    async fn repeated_records_are_counted_in_the_snapshot() {
        let broker = MemoryBroker::default();
        let control = ControlPlane::with_config(AgentConfig::default());
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_admitter(
            Arc::new(broker.clone()),
            Arc::new(Mutex::new(rx)),
            control.clone(),
            Duration::from_millis(5),
            cancel.clone(),
        ));

        tx.send(record(1)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(broker.stream_len(), 1);
        assert_eq!(control.snapshot().duplicates_by_table.get("t"), Some(&2));
    }
}
