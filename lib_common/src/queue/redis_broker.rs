//! # Redis Broker
//!
//! Reliable queue on Redis streams (`XADD` through a Lua admission script,
//! `XREADGROUP`, `XACK`, `XGROUP CREATE ... MKSTREAM`) and the control channel
//! on plain keys (`RPUSH`/`LPOP` FIFO, `SET ... EX` status cache, `HSET`
//! node-status hash).
//!
//! Reads poll without a server-side `BLOCK` so the multiplexed connection
//! behind the [`ConnectionManager`] is never pinned by one caller.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{codec, Admission, Broker, BrokerConnector, Command, ControlChannel, QueueEntry, QueueError, ReliableQueue};
use crate::configs::{RedisConfig, StreamConfig};
use crate::record::CanonicalRecord;

/// Atomic admission.
///
/// KEYS[1] stream, KEYS[2] hash of last payload per table.
/// ARGV[1] table, ARGV[2] packed payload, ARGV[3] approximate max length.
const ADMIT_SCRIPT: &str = r#"
local last = redis.call('HGET', KEYS[2], ARGV[1])
if last == ARGV[2] then
    return 'duplicate'
end
local id = redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[3], '*', 'data', ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 'admitted ' .. id
"#;

/// Field holding the packed record inside a stream entry.
const PAYLOAD_FIELD: &str = "data";
/// Interval between non-blocking reads while waiting in `consume`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Page size of the pending-entry scan.
const PENDING_PAGE: usize = 100;

/// # Redis Broker
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    stream: StreamConfig,
    admit_script: Arc<Script>,
}

impl RedisBroker {
    /// Opens a managed connection, bounded by the configured connect timeout.
    pub async fn connect(redis: &RedisConfig, stream: &StreamConfig) -> Result<Self, QueueError> {
        let client = Client::open(redis.url()).map_err(|e| QueueError::Connection(e.to_string()))?;
        let timeout = Duration::from_secs(redis.connect_timeout_secs.max(1));
        let conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| QueueError::Connection(format!("connect timed out after {:?}", timeout)))?
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        debug!(host = %redis.host, port = redis.port, db = redis.db, "redis connected");
        Ok(Self {
            conn,
            stream: stream.clone(),
            admit_script: Arc::new(Script::new(ADMIT_SCRIPT)),
        })
    }

    fn last_payload_key(&self) -> String {
        format!("{}:last", self.stream.key)
    }

    fn classify(&self, group: Option<&str>, e: RedisError) -> QueueError {
        if e.code() == Some("NOGROUP") {
            return QueueError::GroupMissing {
                stream: self.stream.key.clone(),
                group: group.unwrap_or_default().to_string(),
            };
        }
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Command(e.to_string())
        }
    }

    /// One non-blocking `XREADGROUP`.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        start: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.stream.key)
            .arg(start)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(Some(group), e))?;
        parse_read_reply(reply)
    }
}

#[async_trait]
impl ReliableQueue for RedisBroker {
    async fn admit(&self, record: &CanonicalRecord) -> Result<Admission, QueueError> {
        let payload = codec::pack(record)?;
        let mut conn = self.conn.clone();
        let reply: String = self
            .admit_script
            .key(&self.stream.key)
            .key(self.last_payload_key())
            .arg(&record.destination_table)
            .arg(payload)
            .arg(self.stream.max_len)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))?;
        Admission::from_reply(&reply)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<Value, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream.key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => {
                debug!(stream = %self.stream.key, group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(self.classify(Some(group), e)),
        }
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            for raw in self.read_group(group, consumer, ">", 1).await? {
                match raw.payload {
                    Some(payload) => return Ok(Some(QueueEntry { id: raw.id, payload })),
                    None => warn!(id = %raw.id, "stream entry without payload field"),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, group: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream.key)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(Some(group), e))?;
        Ok(())
    }

    async fn recover_pending(&self, group: &str, consumer: &str) -> Result<Vec<QueueEntry>, QueueError> {
        let mut recovered = Vec::new();
        let mut start = "0".to_string();
        loop {
            let page = self.read_group(group, consumer, &start, PENDING_PAGE).await?;
            let Some(last) = page.last() else {
                break;
            };
            start = last.id.clone();
            let full_page = page.len() == PENDING_PAGE;
            for raw in page {
                match raw.payload {
                    Some(payload) => recovered.push(QueueEntry { id: raw.id, payload }),
                    None => {
                        // Trimmed from the stream after delivery; nothing left to redeliver.
                        debug!(id = %raw.id, "dropping pending id of trimmed entry");
                        self.ack(group, &raw.id).await?;
                    }
                }
            }
            if !full_page {
                break;
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl ControlChannel for RedisBroker {
    async fn push_command(&self, command: Command) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.stream.command_key)
            .arg(command.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))?;
        Ok(())
    }

    async fn pop_command(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LPOP")
            .arg(&self.stream.command_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))
    }

    async fn store_local_status(&self, snapshot: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: Value = redis::cmd("SET")
            .arg(&self.stream.status_key)
            .arg(snapshot)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))?;
        Ok(())
    }

    async fn load_local_status(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(&self.stream.status_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))
    }

    async fn clear_local_status(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(&self.stream.status_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))?;
        Ok(())
    }

    async fn publish_node_status(&self, node: &str, snapshot: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(&self.stream.node_status_key)
            .arg(node)
            .arg(snapshot)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))?;
        Ok(())
    }

    async fn node_statuses(&self) -> Result<BTreeMap<String, String>, QueueError> {
        let mut conn = self.conn.clone();
        let all: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&self.stream.node_status_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(None, e))?;
        Ok(all.into_iter().collect())
    }
}

/// # Redis Connector
///
/// Opens a fresh [`RedisBroker`] connection per call.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    pub redis: RedisConfig,
    pub stream: StreamConfig,
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError> {
        let broker = RedisBroker::connect(&self.redis, &self.stream).await?;
        Ok(Arc::new(broker))
    }
}

/// A stream entry as returned by `XREADGROUP`. `payload` is `None` for
/// pending ids whose entry was deleted.
#[derive(Debug, PartialEq)]
struct RawEntry {
    id: String,
    payload: Option<Vec<u8>>,
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn malformed(what: &str) -> QueueError {
    QueueError::Command(format!("unexpected XREADGROUP reply: {}", what))
}

/// Parses `[[stream, [[id, [field, value, ...]], ...]]]` (RESP2) or the RESP3
/// map form into entries.
fn parse_read_reply(reply: Value) -> Result<Vec<RawEntry>, QueueError> {
    let streams: Vec<Value> = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => streams
            .into_iter()
            .map(|stream| match stream {
                Value::Array(mut pair) if pair.len() == 2 => Ok(pair.remove(1)),
                _ => Err(malformed("stream element")),
            })
            .collect::<Result<_, _>>()?,
        Value::Map(pairs) => pairs.into_iter().map(|(_, entries)| entries).collect(),
        _ => return Err(malformed("top level")),
    };

    let mut out = Vec::new();
    for entries in streams {
        let Value::Array(entries) = entries else {
            return Err(malformed("entry list"));
        };
        for entry in entries {
            let Value::Array(mut parts) = entry else {
                return Err(malformed("entry"));
            };
            if parts.len() != 2 {
                return Err(malformed("entry arity"));
            }
            let fields = parts.remove(1);
            let id = text(&parts[0]).ok_or_else(|| malformed("entry id"))?;
            out.push(RawEntry {
                id,
                payload: payload_field(fields),
            });
        }
    }
    Ok(out)
}

fn payload_field(fields: Value) -> Option<Vec<u8>> {
    let pairs: Vec<(Value, Value)> = match fields {
        Value::Array(flat) => {
            let mut it = flat.into_iter();
            let mut pairs = Vec::new();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                pairs.push((k, v));
            }
            pairs
        }
        Value::Map(pairs) => pairs,
        _ => return None,
    };
    pairs.into_iter().find_map(|(k, v)| match (text(&k).as_deref(), v) {
        (Some(PAYLOAD_FIELD), Value::BulkString(bytes)) => Some(bytes),
        _ => None,
    })
}
