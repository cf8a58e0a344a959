//! Per-sink record shaping.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::SinkError;
use crate::configs::SinkKind;
use crate::record::{CanonicalRecord, TimestampUnit};

/// Format of the human-readable pub/sub timestamp.
pub const PUBSUB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Tags looked up, in order, for the pub/sub `deviceid`.
const DEVICE_ID_TAGS: [&str; 2] = ["eqpt_no", "deviceid"];

/// One time-series point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub time: i64,
    pub fields: BTreeMap<String, Value>,
    pub unit: TimestampUnit,
}

/// A pub/sub message body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PubsubMessage {
    pub timestamp: String,
    pub fields: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviceid: Option<String>,
}

/// A record shaped for one sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Shaped {
    /// Time-series batch.
    Points(Vec<Point>),
    /// Broker envelope built by the adapter's packer.
    Envelope(Value),
    /// Pub/sub message.
    Message(PubsubMessage),
    /// Relational row; column mapping is the adapter's business.
    Row(CanonicalRecord),
}

/// Shaping shared by every sink except the broker.
pub fn default_shape(kind: SinkKind, record: &CanonicalRecord) -> Result<Shaped, SinkError> {
    match kind {
        SinkKind::Timeseries => Ok(Shaped::Points(vec![point(record)])),
        SinkKind::Pubsub => pubsub_message(record).map(Shaped::Message),
        SinkKind::Relational => Ok(Shaped::Row(record.clone())),
        SinkKind::Broker => Err(SinkError::Shape(
            "broker sinks shape records with their own packer".to_string(),
        )),
    }
}

pub fn point(record: &CanonicalRecord) -> Point {
    Point {
        measurement: record.destination_table.clone(),
        tags: record.tags.clone(),
        time: record.timestamp,
        fields: record.fields.clone(),
        unit: record.unit,
    }
}

pub fn pubsub_message(record: &CanonicalRecord) -> Result<PubsubMessage, SinkError> {
    let timestamp = record
        .unit
        .to_datetime(record.timestamp)
        .ok_or_else(|| SinkError::Shape(format!("timestamp {} out of range", record.timestamp)))?
        .format(PUBSUB_TIME_FORMAT)
        .to_string();
    let (schema, table) = match record.schema_and_table() {
        Some((schema, table)) => (Some(schema.to_string()), Some(table.to_string())),
        None => (None, None),
    };
    let deviceid = DEVICE_ID_TAGS
        .iter()
        .find_map(|tag| record.tags.get(*tag))
        .cloned();
    Ok(PubsubMessage {
        timestamp,
        fields: record.fields.clone(),
        schema,
        table,
        deviceid,
    })
}

/// The broker envelope
/// `{ts, ip, dataid, org, dims{data_name, ...tags}, vals{...fields, time}}`.
///
/// `ts` is always in seconds; `vals.time` keeps the record's own unit.
pub fn broker_envelope(record: &CanonicalRecord, ip: &str, dataid: i64, org: i64) -> Value {
    let ts = match record.unit {
        TimestampUnit::Seconds => record.timestamp,
        TimestampUnit::Micros => record.timestamp / 1_000_000,
    };
    let mut dims = Map::new();
    dims.insert("data_name".to_string(), Value::String(record.destination_table.clone()));
    for (k, v) in &record.tags {
        dims.insert(k.clone(), Value::String(v.clone()));
    }
    let mut vals: Map<String, Value> = record.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vals.insert("time".to_string(), Value::from(record.timestamp));
    json!({
        "ts": ts,
        "ip": ip,
        "dataid": dataid,
        "org": org,
        "dims": dims,
        "vals": vals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(table: &str, unit: TimestampUnit, ts: i64) -> CanonicalRecord {
        let fields = serde_json::from_value(json!({"temp": 20.5})).unwrap();
        let tags = [("eqpt_no".to_string(), "1900".to_string())].into_iter().collect();
        CanonicalRecord::new(table, fields, tags, unit, ts).unwrap()
    }

    #[test]
    fn timeseries_is_a_one_point_batch_without_reserved_keys() {
        let Shaped::Points(points) =
            default_shape(SinkKind::Timeseries, &record("boiler", TimestampUnit::Seconds, 10)).unwrap()
        else {
            panic!("expected points");
        };
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "boiler");
        assert!(!points[0].fields.contains_key("tags"));
        assert!(!points[0].fields.contains_key("unit"));
        assert_eq!(points[0].tags.get("eqpt_no").map(String::as_str), Some("1900"));
    }

    #[test]
    fn pubsub_message_has_readable_time_and_dotted_table() {
        let message = pubsub_message(&record("plant.boiler", TimestampUnit::Micros, 1_700_000_000_500_000)).unwrap();
        assert_eq!(message.timestamp, "2023-11-14 22:13:20");
        assert_eq!(message.schema.as_deref(), Some("plant"));
        assert_eq!(message.table.as_deref(), Some("boiler"));
        assert_eq!(message.deviceid.as_deref(), Some("1900"));

        let plain = pubsub_message(&record("boiler", TimestampUnit::Seconds, 0)).unwrap();
        let body = serde_json::to_value(&plain).unwrap();
        assert_eq!(body.get("schema"), None);
        assert_eq!(body["fields"], json!({"temp": 20.5}));
    }

    #[test]
    fn broker_envelope_layout() {
        let envelope = broker_envelope(&record("boiler", TimestampUnit::Micros, 1_700_000_000_123_456), "10.0.0.1", 7, 3101);
        assert_eq!(envelope["ts"], json!(1_700_000_000));
        assert_eq!(envelope["ip"], json!("10.0.0.1"));
        assert_eq!(envelope["dims"], json!({"data_name": "boiler", "eqpt_no": "1900"}));
        assert_eq!(envelope["vals"], json!({"temp": 20.5, "time": 1_700_000_000_123_456i64}));
        assert!(default_shape(SinkKind::Broker, &record("b", TimestampUnit::Seconds, 1)).is_err());
    }
}
