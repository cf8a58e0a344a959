//! # Queue Payload Codec
//!
//! Records travel through the queue as a msgpack map
//! `{table_name, fields, time}` where `fields` embeds the reserved `tags` and
//! `unit` keys. Producers written in other languages can push the same map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::QueueError;
use crate::record::CanonicalRecord;

/// The on-wire map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub table_name: String,
    pub fields: BTreeMap<String, Value>,
    pub time: WireTime,
}

/// Accepts integer and float timestamps from foreign producers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Int(i64),
    Float(f64),
}

impl WireTime {
    fn as_i64(self) -> i64 {
        match self {
            WireTime::Int(v) => v,
            WireTime::Float(v) => v as i64,
        }
    }
}

/// Packs a record into queue payload bytes.
pub fn pack(record: &CanonicalRecord) -> Result<Vec<u8>, QueueError> {
    let wire = WireRecord {
        table_name: record.destination_table.clone(),
        fields: record.embedded_fields(),
        time: WireTime::Int(record.timestamp),
    };
    rmp_serde::to_vec_named(&wire).map_err(|e| QueueError::Codec(e.to_string()))
}

/// Decodes queue payload bytes back into a record.
pub fn unpack(payload: &[u8]) -> Result<CanonicalRecord, QueueError> {
    let wire: WireRecord =
        rmp_serde::from_slice(payload).map_err(|e| QueueError::Codec(e.to_string()))?;
    CanonicalRecord::from_embedded(wire.table_name, wire.fields, wire.time.as_i64())
        .map_err(|e| QueueError::Malformed(e.to_string()))
}
