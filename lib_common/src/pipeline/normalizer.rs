//! # Normalizer
//!
//! Turns raw readings into [`CanonicalRecord`]s in two steps. A pluggable
//! [`Normalizer`] maps one raw value to zero or more [`HandlerOutput`]s, then
//! [`NormalizerDefaults::to_record`] applies the node's defaults:
//!
//! - a list `data_value` is zipped against `field_name_list`, a map is taken
//!   as already-named fields;
//! - a missing `table_name` falls back to `[normalizer].table_name`;
//! - a missing `timestamp` becomes the current time in the configured unit;
//! - tags are the configured default tags overlaid with the handler's tags.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Number, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::NormalizeError;
use crate::configs::NormalizerConfig;
use crate::record::{tag_string, CanonicalRecord, TimestampUnit};

/// Measurement values as produced by a handler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    /// Positional values, named by `field_name_list`.
    List(Vec<Value>),
    /// Already-named fields.
    Map(BTreeMap<String, Value>),
}

/// # Handler Output
///
/// One map yielded by a [`Normalizer`]. Only `data_value` is required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandlerOutput {
    pub data_value: DataValue,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Number>,
    /// Overrides the configured unit marker for this output.
    #[serde(default)]
    pub unit: Option<String>,
}

impl HandlerOutput {
    pub fn from_value(value: Value) -> Result<Self, NormalizeError> {
        serde_json::from_value(value).map_err(|e| NormalizeError::Shape(e.to_string()))
    }
}

/// # Normalizer
///
/// The user-pluggable transform of one raw reading.
pub trait Normalizer: Send {
    fn normalize(&mut self, raw: Value) -> Result<Vec<HandlerOutput>, NormalizeError>;
}

/// Defaults applied to every handler output.
#[derive(Debug, Clone)]
pub struct NormalizerDefaults {
    pub field_names: Vec<String>,
    pub table_name: String,
    pub unit: TimestampUnit,
    pub tags: BTreeMap<String, String>,
}

impl From<&NormalizerConfig> for NormalizerDefaults {
    fn from(config: &NormalizerConfig) -> Self {
        Self {
            field_names: config.field_name_list.clone(),
            table_name: config.table_name.clone(),
            unit: TimestampUnit::parse(&config.unit),
            tags: config.default_tags.clone(),
        }
    }
}

impl NormalizerDefaults {
    /// Builds the canonical record for one handler output.
    pub fn to_record(&self, output: HandlerOutput) -> Result<CanonicalRecord, NormalizeError> {
        let table = output
            .table_name
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.table_name.clone());

        let fields = match output.data_value {
            DataValue::Map(fields) => fields,
            DataValue::List(values) => {
                if values.len() != self.field_names.len() {
                    warn!(
                        worker = "normalizer",
                        table = %table,
                        names = self.field_names.len(),
                        values = values.len(),
                        "field name list and data_value differ in length, extra entries ignored"
                    );
                }
                self.field_names.iter().cloned().zip(values).collect()
            }
        };

        let unit = output
            .unit
            .as_deref()
            .map(TimestampUnit::parse)
            .unwrap_or(self.unit);

        let timestamp = output
            .timestamp
            .and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)))
            .unwrap_or_else(|| unit.now());

        let mut tags = self.tags.clone();
        if let Some(handler_tags) = output.tags {
            tags.extend(handler_tags.into_iter().map(|(k, v)| (k, tag_string(v))));
        }

        Ok(CanonicalRecord::new(table, fields, tags, unit, timestamp)?)
    }
}

/// # JSON Normalizer
///
/// Accepts a handler-output map, a list of them, or a string holding either.
#[derive(Debug, Default)]
pub struct JsonNormalizer;

impl Normalizer for JsonNormalizer {
    fn normalize(&mut self, raw: Value) -> Result<Vec<HandlerOutput>, NormalizeError> {
        match raw {
            Value::Object(_) => Ok(vec![HandlerOutput::from_value(raw)?]),
            Value::Array(items) => items.into_iter().map(HandlerOutput::from_value).collect(),
            Value::String(text) => {
                let parsed: Value =
                    serde_json::from_str(&text).map_err(|e| NormalizeError::Shape(e.to_string()))?;
                if parsed.is_string() {
                    return Err(NormalizeError::Shape("nested JSON string".to_string()));
                }
                self.normalize(parsed)
            }
            other => Err(NormalizeError::Shape(format!("expected map or list, got {}", other))),
        }
    }
}

/// # Fields Normalizer
///
/// Splits a delimited text line (or takes a JSON list as is) into a list
/// `data_value`. Numeric tokens become numbers.
#[derive(Debug)]
pub struct FieldsNormalizer {
    delimiter: String,
}

impl FieldsNormalizer {
    pub fn new(delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        Self {
            delimiter: if delimiter.is_empty() { ",".to_string() } else { delimiter },
        }
    }

    fn token(raw: &str) -> Value {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            return Value::from(i);
        }
        match raw.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(raw.to_string()),
        }
    }
}

impl Normalizer for FieldsNormalizer {
    fn normalize(&mut self, raw: Value) -> Result<Vec<HandlerOutput>, NormalizeError> {
        let values = match raw {
            Value::String(line) => line.split(self.delimiter.as_str()).map(Self::token).collect(),
            Value::Array(values) => values,
            other => return Err(NormalizeError::Shape(format!("expected delimited text, got {}", other))),
        };
        Ok(vec![HandlerOutput {
            data_value: DataValue::List(values),
            tags: None,
            table_name: None,
            timestamp: None,
            unit: None,
        }])
    }
}

/// # Run Normalizer
///
/// Pulls raw values, normalizes them and pushes records onto the normalized
/// channel until `cancel` fires. A value that fails to normalize is logged
/// and dropped.
pub async fn run_normalizer(
    mut normalizer: Box<dyn Normalizer>,
    defaults: NormalizerDefaults,
    raw_rx: Arc<Mutex<mpsc::UnboundedReceiver<Value>>>,
    normalized_tx: mpsc::Sender<CanonicalRecord>,
    cancel: CancellationToken,
) {
    info!(worker = "normalizer", "started");
    'outer: loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = async { raw_rx.lock().await.recv().await } => raw,
        };
        let Some(raw) = raw else {
            warn!(worker = "normalizer", "raw channel closed");
            break;
        };

        let outputs = match normalizer.normalize(raw) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(worker = "normalizer", error = %e, "raw value dropped");
                continue;
            }
        };
        for output in outputs {
            let record = match defaults.to_record(output) {
                Ok(record) => record,
                Err(e) => {
                    warn!(worker = "normalizer", error = %e, "handler output dropped");
                    continue;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                sent = normalized_tx.send(record) => {
                    if sent.is_err() {
                        warn!(worker = "normalizer", "normalized channel closed");
                        break 'outer;
                    }
                }
            }
        }
    }
    info!(worker = "normalizer", "stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults(names: &[&str], unit: &str) -> NormalizerDefaults {
        NormalizerDefaults::from(&NormalizerConfig {
            field_name_list: names.iter().map(|s| s.to_string()).collect(),
            unit: unit.to_string(),
            ..NormalizerConfig::default()
        })
    }

    fn output(value: Value) -> HandlerOutput {
        HandlerOutput::from_value(value).unwrap()
    }

    #[test]
    fn length_mismatch_is_truncated_with_a_warning() {
        use crate::loggers::{LogRing, RingLayer};
        use tracing_subscriber::prelude::*;

        let ring = LogRing::default();
        let subscriber = tracing_subscriber::registry().with(RingLayer::new(ring.clone()));
        let record = tracing::subscriber::with_default(subscriber, || {
            defaults(&["a", "b"], "s")
                .to_record(output(json!({"data_value": [1, 2, 3], "table_name": "power"})))
                .unwrap()
        });

        assert_eq!(record.fields.len(), 2);
        let entries = ring.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "WARN");
        assert!(entries[0].message.contains("table=power"));
        assert!(entries[0].message.contains("names=2"));
        assert!(entries[0].message.contains("values=3"));
    }

    #[test]
    fn list_values_are_zipped_with_field_names() {
        let record = defaults(&["a", "b"], "s")
            .to_record(output(json!({"data_value": [1, 2]})))
            .unwrap();
        assert_eq!(serde_json::to_value(&record.fields).unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn map_values_pass_through_unchanged() {
        let record = defaults(&["a", "b"], "s")
            .to_record(output(json!({"data_value": {"x": 1}})))
            .unwrap();
        assert_eq!(serde_json::to_value(&record.fields).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn missing_timestamp_defaults_to_now_in_seconds() {
        let before = chrono::Utc::now().timestamp();
        let record = defaults(&[], "s")
            .to_record(output(json!({"data_value": {"x": 1}})))
            .unwrap();
        let after = chrono::Utc::now().timestamp();
        assert_eq!(record.unit, TimestampUnit::Seconds);
        assert!(record.timestamp >= before && record.timestamp <= after + 1);
    }

    #[test]
    fn missing_timestamp_defaults_to_now_in_micros_for_other_units() {
        let before = chrono::Utc::now().timestamp_micros();
        let record = defaults(&[], "u")
            .to_record(output(json!({"data_value": {"x": 1}})))
            .unwrap();
        assert_eq!(record.unit, TimestampUnit::Micros);
        assert!(record.timestamp >= before);
        assert!(record.timestamp - before < 1_000_000);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let mut base = defaults(&[], "s");
        base.tags.insert("site".to_string(), "plant-1".to_string());
        base.tags.insert("line".to_string(), "1".to_string());
        let record = base
            .to_record(output(json!({
                "data_value": {"x": 1},
                "tags": {"line": 2},
                "table_name": "boiler",
                "timestamp": 1_700_000_000
            })))
            .unwrap();
        assert_eq!(record.destination_table, "boiler");
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.tags.get("site").map(String::as_str), Some("plant-1"));
        assert_eq!(record.tags.get("line").map(String::as_str), Some("2"));
    }

    #[test]
    fn json_normalizer_accepts_maps_lists_and_strings() {
        let mut n = JsonNormalizer;
        assert_eq!(n.normalize(json!({"data_value": [1]})).unwrap().len(), 1);
        assert_eq!(
            n.normalize(json!([{"data_value": [1]}, {"data_value": {"a": 2}}])).unwrap().len(),
            2
        );
        assert_eq!(n.normalize(json!("{\"data_value\": [3]}")).unwrap().len(), 1);
        assert!(n.normalize(json!(5)).is_err());
        assert!(n.normalize(json!({"tags": {}})).is_err());
    }

    #[test]
    fn fields_normalizer_splits_and_types_tokens() {
        let mut n = FieldsNormalizer::new(";");
        let outputs = n.normalize(json!("1; 2.5 ;idle")).unwrap();
        assert_eq!(
            outputs[0].data_value,
            DataValue::List(vec![json!(1), json!(2.5), json!("idle")])
        );
    }

    #[tokio::test]
    async fn loop_emits_one_record_per_output_in_order() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_normalizer(
            Box::new(JsonNormalizer),
            defaults(&["v"], "s"),
            Arc::new(Mutex::new(raw_rx)),
            tx,
            cancel.clone(),
        ));
        raw_tx.send(json!(42)).unwrap();
        raw_tx
            .send(json!([{"data_value": [1], "timestamp": 1}, {"data_value": [2], "timestamp": 2}]))
            .unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.timestamp, second.timestamp), (1, 2));
        cancel.cancel();
        handle.await.unwrap();
    }
}
