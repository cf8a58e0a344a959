//! # Memory Broker
//!
//! An in-process implementation of [`ReliableQueue`] and [`ControlChannel`]
//! with the same observable semantics as the Redis broker: ordered entry ids,
//! consumer groups with a delivery cursor and a pending list, admission
//! dedupe per destination table, an approximate length cap, a command FIFO,
//! an expiring status cache and a node-status hash.
//!
//! Clones share state, so one instance can back every worker of a process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{codec, Admission, Broker, BrokerConnector, Command, ControlChannel, QueueEntry, QueueError, ReliableQueue};
use crate::configs::StreamConfig;
use crate::record::CanonicalRecord;

/// Stream entry id, `<millis>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
struct EntryId {
    millis: u64,
    seq: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::Command(format!("invalid stream id '{}'", s));
        let (millis, seq) = s.split_once('-').unwrap_or((s, "0"));
        Ok(EntryId {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    /// Entry id -> consumer it was delivered to.
    pending: BTreeMap<EntryId, String>,
}

#[derive(Default)]
struct State {
    last_id: EntryId,
    entries: BTreeMap<EntryId, Vec<u8>>,
    last_payload_by_table: HashMap<String, Vec<u8>>,
    groups: HashMap<String, GroupState>,
    commands: VecDeque<String>,
    local_status: Option<(String, Instant)>,
    node_status: BTreeMap<String, String>,
}

struct Shared {
    stream: StreamConfig,
    state: Mutex<State>,
    arrivals: Notify,
    offline: AtomicBool,
}

/// # Memory Broker
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(stream: StreamConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream,
                state: Mutex::new(State::default()),
                arrivals: Notify::new(),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Simulates a broker outage: every call fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Drops every consumer group, as a wiped broker would.
    pub fn drop_groups(&self) {
        self.lock().groups.clear();
    }

    /// Number of entries currently held by the stream.
    pub fn stream_len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of entries delivered to the group and not acknowledged.
    pub fn pending_count(&self, group: &str) -> usize {
        self.lock().groups.get(group).map(|g| g.pending.len()).unwrap_or(0)
    }

    /// Number of commands waiting in the FIFO.
    pub fn command_backlog(&self) -> usize {
        self.lock().commands.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn online(&self) -> Result<(), QueueError> {
        if self.shared.offline.load(Ordering::SeqCst) {
            Err(QueueError::Connection("memory broker offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn group_missing(&self, group: &str) -> QueueError {
        QueueError::GroupMissing {
            stream: self.shared.stream.key.clone(),
            group: group.to_string(),
        }
    }

    fn next_id(state: &mut State) -> EntryId {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if millis > state.last_id.millis {
            EntryId { millis, seq: 0 }
        } else {
            EntryId {
                millis: state.last_id.millis,
                seq: state.last_id.seq + 1,
            }
        };
        state.last_id = id;
        id
    }

    /// Delivers the next entry past the group's cursor, if any.
    fn deliver(&self, group: &str, consumer: &str) -> Result<Option<QueueEntry>, QueueError> {
        let mut state = self.lock();
        let State { entries, groups, .. } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(|| self.group_missing(group))?;
        let cursor = group_state.last_delivered;
        let next = entries
            .range(cursor..)
            .find(|(id, _)| **id > cursor)
            .map(|(id, payload)| (*id, payload.clone()));
        Ok(next.map(|(id, payload)| {
            group_state.last_delivered = id;
            group_state.pending.insert(id, consumer.to_string());
            QueueEntry {
                id: id.to_string(),
                payload,
            }
        }))
    }
}

#[async_trait]
impl ReliableQueue for MemoryBroker {
    async fn admit(&self, record: &CanonicalRecord) -> Result<Admission, QueueError> {
        self.online()?;
        let payload = codec::pack(record)?;
        let admission = {
            let mut state = self.lock();
            if state.last_payload_by_table.get(&record.destination_table) == Some(&payload) {
                return Ok(Admission::Duplicate);
            }
            let id = Self::next_id(&mut state);
            state.entries.insert(id, payload.clone());
            state
                .last_payload_by_table
                .insert(record.destination_table.clone(), payload);
            let cap = self.shared.stream.max_len.max(1) as usize;
            while state.entries.len() > cap {
                state.entries.pop_first();
            }
            Admission::Admitted(id.to_string())
        };
        self.shared.arrivals.notify_waiters();
        Ok(admission)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        self.online()?;
        self.lock().groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<QueueEntry>, QueueError> {
        self.online()?;
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an admit in between is not missed.
            let notified = self.shared.arrivals.notified();
            if let Some(entry) = self.deliver(group, consumer)? {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, group: &str, id: &str) -> Result<(), QueueError> {
        self.online()?;
        let id: EntryId = id.parse()?;
        let mut state = self.lock();
        let group_state = state.groups.get_mut(group).ok_or_else(|| self.group_missing(group))?;
        group_state.pending.remove(&id);
        Ok(())
    }

    async fn recover_pending(&self, group: &str, consumer: &str) -> Result<Vec<QueueEntry>, QueueError> {
        self.online()?;
        let mut state = self.lock();
        let State { entries, groups, .. } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(|| self.group_missing(group))?;

        let mut recovered = Vec::new();
        let mut trimmed = Vec::new();
        for (id, owner) in &group_state.pending {
            if owner != consumer {
                continue;
            }
            match entries.get(id) {
                Some(payload) => recovered.push(QueueEntry {
                    id: id.to_string(),
                    payload: payload.clone(),
                }),
                None => trimmed.push(*id),
            }
        }
        // Entries trimmed by the length cap can never be delivered again.
        for id in trimmed {
            group_state.pending.remove(&id);
        }
        Ok(recovered)
    }
}

#[async_trait]
impl ControlChannel for MemoryBroker {
    async fn push_command(&self, command: Command) -> Result<(), QueueError> {
        self.online()?;
        self.lock().commands.push_back(command.as_str().to_string());
        Ok(())
    }

    async fn pop_command(&self) -> Result<Option<String>, QueueError> {
        self.online()?;
        Ok(self.lock().commands.pop_front())
    }

    async fn store_local_status(&self, snapshot: &str, ttl: Duration) -> Result<(), QueueError> {
        self.online()?;
        self.lock().local_status = Some((snapshot.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn load_local_status(&self) -> Result<Option<String>, QueueError> {
        self.online()?;
        let mut state = self.lock();
        match &state.local_status {
            Some((snapshot, expires)) if Instant::now() < *expires => Ok(Some(snapshot.clone())),
            Some(_) => {
                state.local_status = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear_local_status(&self) -> Result<(), QueueError> {
        self.online()?;
        self.lock().local_status = None;
        Ok(())
    }

    async fn publish_node_status(&self, node: &str, snapshot: &str) -> Result<(), QueueError> {
        self.online()?;
        self.lock().node_status.insert(node.to_string(), snapshot.to_string());
        Ok(())
    }

    async fn node_statuses(&self) -> Result<BTreeMap<String, String>, QueueError> {
        self.online()?;
        Ok(self.lock().node_status.clone())
    }
}

/// Hands out the same shared memory broker to every worker.
#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError> {
        self.online()?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TimestampUnit;
    use serde_json::json;

    fn record(table: &str, value: i64) -> CanonicalRecord {
        let fields = serde_json::from_value(json!({ "v": value })).unwrap();
        CanonicalRecord::new(table, fields, BTreeMap::new(), TimestampUnit::Seconds, value).unwrap()
    }

    #[tokio::test]
    async fn consume_requires_group_and_delivers_in_order() {
        let broker = MemoryBroker::default();
        broker.admit(&record("t", 1)).await.unwrap();
        broker.admit(&record("t", 2)).await.unwrap();

        let missing = broker.consume("g", "c", Duration::from_millis(1)).await;
        assert!(matches!(missing, Err(QueueError::GroupMissing { .. })));

        broker.ensure_group("g").await.unwrap();
        broker.ensure_group("g").await.unwrap();
        let first = broker.consume("g", "c", Duration::from_millis(1)).await.unwrap().unwrap();
        let second = broker.consume("g", "c", Duration::from_millis(1)).await.unwrap().unwrap();
        assert!(first.id.parse::<EntryId>().unwrap() < second.id.parse::<EntryId>().unwrap());
        assert_eq!(codec::unpack(&first.payload).unwrap().timestamp, 1);
        assert!(broker.consume("g", "c", Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_entries_are_recovered_and_acked_ones_are_not() {
        let broker = MemoryBroker::default();
        broker.ensure_group("g").await.unwrap();
        broker.admit(&record("t", 1)).await.unwrap();
        broker.admit(&record("t", 2)).await.unwrap();

        let a = broker.consume("g", "c", Duration::ZERO).await.unwrap().unwrap();
        let b = broker.consume("g", "c", Duration::ZERO).await.unwrap().unwrap();
        broker.ack("g", &a.id).await.unwrap();

        let pending = broker.recover_pending("g", "c").await.unwrap();
        assert_eq!(pending, vec![b.clone()]);
        assert!(broker.recover_pending("g", "other").await.unwrap().is_empty());

        broker.ack("g", &b.id).await.unwrap();
        assert!(broker.recover_pending("g", "c").await.unwrap().is_empty());
        assert_eq!(broker.pending_count("g"), 0);
    }

    #[tokio::test]
    async fn identical_consecutive_payloads_are_skipped_per_table() {
        let broker = MemoryBroker::default();
        assert!(matches!(broker.admit(&record("t", 1)).await.unwrap(), Admission::Admitted(_)));
        assert_eq!(broker.admit(&record("t", 1)).await.unwrap(), Admission::Duplicate);
        assert!(matches!(broker.admit(&record("u", 1)).await.unwrap(), Admission::Admitted(_)));
        assert!(matches!(broker.admit(&record("t", 2)).await.unwrap(), Admission::Admitted(_)));
        assert_eq!(broker.stream_len(), 3);
    }

    #[tokio::test]
    async fn blocked_consumer_wakes_on_admission() {
        let broker = MemoryBroker::default();
        broker.ensure_group("g").await.unwrap();
        let reader = broker.clone();
        let handle = tokio::spawn(async move { reader.consume("g", "c", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.admit(&record("t", 7)).await.unwrap();
        let entry = handle.await.unwrap().unwrap();
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn length_cap_trims_oldest_and_drops_their_pending_ids() {
        let stream = StreamConfig {
            max_len: 2,
            ..StreamConfig::default()
        };
        let broker = MemoryBroker::new(stream);
        broker.ensure_group("g").await.unwrap();
        broker.admit(&record("t", 1)).await.unwrap();
        let first = broker.consume("g", "c", Duration::ZERO).await.unwrap().unwrap();
        broker.admit(&record("t", 2)).await.unwrap();
        broker.admit(&record("t", 3)).await.unwrap();
        assert_eq!(broker.stream_len(), 2);

        let pending = broker.recover_pending("g", "c").await.unwrap();
        assert!(pending.iter().all(|e| e.id != first.id));
        assert_eq!(broker.pending_count("g"), 0);
    }

    #[tokio::test]
    async fn control_primitives() {
        let broker = MemoryBroker::default();
        broker.push_command(Command::Reload).await.unwrap();
        broker.push_command(Command::GetStatus).await.unwrap();
        assert_eq!(broker.pop_command().await.unwrap().as_deref(), Some("reload"));
        assert_eq!(broker.pop_command().await.unwrap().as_deref(), Some("get_status"));
        assert_eq!(broker.pop_command().await.unwrap(), None);

        broker.store_local_status("{}", Duration::from_millis(20)).await.unwrap();
        assert_eq!(broker.load_local_status().await.unwrap().as_deref(), Some("{}"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.load_local_status().await.unwrap(), None);

        broker.publish_node_status("n1", "{\"node_id\":\"n1\"}").await.unwrap();
        assert_eq!(broker.node_statuses().await.unwrap().len(), 1);

        broker.set_offline(true);
        assert!(matches!(broker.pop_command().await, Err(QueueError::Connection(_))));
    }
}
