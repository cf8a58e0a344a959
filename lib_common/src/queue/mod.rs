//! # Reliable Queue
//!
//! The broker-backed durable queue between the admitter and the transport,
//! and the small control channel riding on the same broker.
//!
//! ## Contract
//! - [`ReliableQueue::admit`] packs a record and pushes it through one atomic
//!   broker-side operation. Nothing is written when it fails.
//! - [`ReliableQueue::consume`] waits up to a bounded interval and returns at
//!   most one entry, in id order for the group.
//! - [`ReliableQueue::ack`] removes an entry from the group's pending list.
//!   Entries that are never acknowledged stay recoverable.
//! - [`ReliableQueue::recover_pending`] returns every entry still outstanding
//!   for a consumer, so a restarted transport redelivers what a crashed one
//!   left behind.
//! - A missing consumer group is reported as [`QueueError::GroupMissing`] so
//!   callers can recreate it with [`ReliableQueue::ensure_group`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::record::CanonicalRecord;

/// msgpack wire format of queue payloads.
pub mod codec;
/// In-process broker used by tests and single-process runs.
pub mod memory;
/// Redis streams broker.
pub mod redis_broker;

pub use codec::{pack, unpack, WireRecord};
pub use memory::MemoryBroker;
pub use redis_broker::{RedisBroker, RedisConnector};

/// Errors raised by a broker.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    /// The consumer group does not exist (first run or wiped broker).
    #[error("consumer group '{group}' does not exist on '{stream}'")]
    GroupMissing { stream: String, group: String },

    /// The broker could not be reached.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed a command.
    #[error("broker command error: {0}")]
    Command(String),

    /// A payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(String),

    /// A payload decoded but does not describe a valid record.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// One delivered queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Broker-assigned id, ordered per queue.
    pub id: String,
    /// Packed record bytes.
    pub payload: Vec<u8>,
}

/// Outcome of an admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The record was appended under the given id.
    Admitted(String),
    /// The packed record was byte-identical to the last one admitted for the
    /// same destination table and was skipped.
    Duplicate,
}

impl Admission {
    /// Parses the admission script reply (`admitted <id>` or `duplicate`).
    pub fn from_reply(reply: &str) -> Result<Self, QueueError> {
        let reply = reply.trim();
        if reply == "duplicate" {
            return Ok(Admission::Duplicate);
        }
        match reply.strip_prefix("admitted ") {
            Some(id) if !id.is_empty() => Ok(Admission::Admitted(id.to_string())),
            _ => Err(QueueError::Command(format!("unexpected admission reply '{}'", reply))),
        }
    }
}

/// # Command
///
/// A control request carried by the broker's command FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    GetStatus,
    Restart,
    Reload,
    Upload,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::GetStatus => "get_status",
            Command::Restart => "restart",
            Command::Reload => "reload",
            Command::Upload => "upload",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "get_status" => Some(Command::GetStatus),
            "restart" => Some(Command::Restart),
            "reload" => Some(Command::Reload),
            "upload" => Some(Command::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Reliable Queue
///
/// Consumer-group queue with atomic admission and explicit acknowledgment.
/// The stream key is fixed when the broker is built.
#[async_trait]
pub trait ReliableQueue: Send + Sync {
    /// Atomically appends a packed record.
    async fn admit(&self, record: &CanonicalRecord) -> Result<Admission, QueueError>;

    /// Creates the consumer group if it does not exist. Safe to repeat.
    async fn ensure_group(&self, group: &str) -> Result<(), QueueError>;

    /// Reads the next undelivered entry for the group, waiting up to `block`.
    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<QueueEntry>, QueueError>;

    /// Acknowledges an entry for the group.
    async fn ack(&self, group: &str, id: &str) -> Result<(), QueueError>;

    /// Returns every entry delivered to `consumer` and not yet acknowledged.
    async fn recover_pending(&self, group: &str, consumer: &str) -> Result<Vec<QueueEntry>, QueueError>;
}

/// # Control Channel
///
/// The non-stream primitives of the broker: a command FIFO, a short-lived
/// local status cache and a per-node status hash.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Appends a command to the FIFO.
    async fn push_command(&self, command: Command) -> Result<(), QueueError>;

    /// Pops the oldest raw command without blocking.
    async fn pop_command(&self) -> Result<Option<String>, QueueError>;

    /// Stores a serialized status snapshot with an expiry.
    async fn store_local_status(&self, snapshot: &str, ttl: Duration) -> Result<(), QueueError>;

    async fn load_local_status(&self) -> Result<Option<String>, QueueError>;

    async fn clear_local_status(&self) -> Result<(), QueueError>;

    /// Writes a node's serialized status into the node-status hash.
    async fn publish_node_status(&self, node: &str, snapshot: &str) -> Result<(), QueueError>;

    /// Reads the whole node-status hash.
    async fn node_statuses(&self) -> Result<BTreeMap<String, String>, QueueError>;
}

/// A broker offering both the reliable queue and the control channel.
pub trait Broker: ReliableQueue + ControlChannel {}

impl<T: ReliableQueue + ControlChannel> Broker for T {}

/// # Broker Connector
///
/// Produces a broker handle. Workers call it themselves so every worker owns
/// its own connection.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError>;
}

/// Connects with a fixed backoff until it succeeds or `cancel` fires.
///
/// Returns `None` only when cancelled.
pub async fn connect_with_retry(
    connector: &dyn BrokerConnector,
    backoff: Duration,
    cancel: &CancellationToken,
    worker: &str,
) -> Option<Arc<dyn Broker>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match connector.connect().await {
            Ok(broker) => return Some(broker),
            Err(e) => {
                warn!(worker, error = %e, "broker connect failed, retrying in {:?}", backoff);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_reply_parsing() {
        assert_eq!(
            Admission::from_reply("admitted 1700000000000-0").unwrap(),
            Admission::Admitted("1700000000000-0".to_string())
        );
        assert_eq!(Admission::from_reply("duplicate").unwrap(), Admission::Duplicate);
        assert!(Admission::from_reply("nope").is_err());
    }

    #[test]
    fn command_names() {
        for command in [Command::GetStatus, Command::Restart, Command::Reload, Command::Upload] {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
        assert_eq!(Command::parse("shutdown"), None);
    }

    struct Flaky {
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BrokerConnector for Flaky {
        async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError> {
            if self.failures.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                Err(QueueError::Connection("refused".to_string()))
            } else {
                Ok(Arc::new(MemoryBroker::default()))
            }
        }
    }

    #[tokio::test]
    async fn connect_retries_until_success_or_cancel() {
        let flaky = Flaky {
            failures: std::sync::atomic::AtomicUsize::new(2),
        };
        let cancel = CancellationToken::new();
        let broker = connect_with_retry(&flaky, Duration::from_millis(5), &cancel, "test").await;
        assert!(broker.is_some());

        let never = Flaky {
            failures: std::sync::atomic::AtomicUsize::new(usize::MAX / 2),
        };
        cancel.cancel();
        assert!(connect_with_retry(&never, Duration::from_millis(5), &cancel, "test").await.is_none());
    }
}
