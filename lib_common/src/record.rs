//! # Canonical Record
//!
//! The unit that flows through every stage of the agent: probes produce raw
//! readings, the normalizer turns them into a [`CanonicalRecord`], the admitter
//! packs it into the reliable queue and the transport unpacks it again before
//! shaping it for a sink.
//!
//! Tags and the timestamp unit are explicit fields here. On the wire (and for
//! any producer that writes to the queue directly) they travel as the reserved
//! keys `tags` and `unit` inside the `fields` map; [`CanonicalRecord::embedded_fields`]
//! and [`CanonicalRecord::from_embedded`] convert between the two shapes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved key holding the tag sub-map inside an embedded `fields` map.
pub const TAGS_KEY: &str = "tags";
/// Reserved key holding the timestamp unit marker inside an embedded `fields` map.
pub const UNIT_KEY: &str = "unit";

/// Precision of [`CanonicalRecord::timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TimestampUnit {
    /// Unix seconds. Marker `"s"`.
    #[default]
    Seconds,
    /// Unix microseconds. Marker `"u"`.
    Micros,
}

impl TimestampUnit {
    /// Parses a unit marker. `"s"` is seconds, anything else is microseconds.
    pub fn parse(marker: &str) -> Self {
        if marker.trim() == "s" {
            TimestampUnit::Seconds
        } else {
            TimestampUnit::Micros
        }
    }

    /// The wire marker, also used as the InfluxDB `precision` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampUnit::Seconds => "s",
            TimestampUnit::Micros => "u",
        }
    }

    /// Current wall-clock time expressed in this unit.
    pub fn now(&self) -> i64 {
        let now = Utc::now();
        match self {
            TimestampUnit::Seconds => now.timestamp(),
            TimestampUnit::Micros => now.timestamp_micros(),
        }
    }

    /// Converts a timestamp in this unit into fractional Unix seconds.
    pub fn to_seconds_f64(&self, timestamp: i64) -> f64 {
        match self {
            TimestampUnit::Seconds => timestamp as f64,
            TimestampUnit::Micros => timestamp as f64 / 1_000_000.0,
        }
    }

    /// Converts a timestamp in this unit into a UTC date-time.
    pub fn to_datetime(&self, timestamp: i64) -> Option<DateTime<Utc>> {
        match self {
            TimestampUnit::Seconds => Utc.timestamp_opt(timestamp, 0).single(),
            TimestampUnit::Micros => DateTime::from_timestamp_micros(timestamp),
        }
    }
}

impl From<String> for TimestampUnit {
    fn from(value: String) -> Self {
        TimestampUnit::parse(&value)
    }
}

impl From<TimestampUnit> for String {
    fn from(value: TimestampUnit) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TimestampUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a record cannot be accepted as canonical.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// `destination_table` was empty.
    #[error("destination table is empty")]
    EmptyTable,
    /// The embedded `tags` entry was present but not a map.
    #[error("reserved key 'tags' is not a map")]
    TagsNotMap,
}

/// # Canonical Record
///
/// One normalized reading bound for `destination_table`.
///
/// Invariants once a record leaves the normalizer: `destination_table` is
/// non-empty, `fields` carries no reserved keys, and `tags`/`unit` are always
/// set (tags possibly empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Measurement / table name the record is written to.
    pub destination_table: String,
    /// Measurement values keyed by field name.
    pub fields: BTreeMap<String, Value>,
    /// Indexed tag values.
    pub tags: BTreeMap<String, String>,
    /// Precision of `timestamp`.
    pub unit: TimestampUnit,
    /// Record time in `unit`.
    pub timestamp: i64,
}

impl CanonicalRecord {
    /// Builds a record, enforcing the non-empty table invariant and removing
    /// any reserved keys a caller left in `fields`.
    pub fn new(
        destination_table: impl Into<String>,
        mut fields: BTreeMap<String, Value>,
        tags: BTreeMap<String, String>,
        unit: TimestampUnit,
        timestamp: i64,
    ) -> Result<Self, RecordError> {
        let destination_table = destination_table.into();
        if destination_table.trim().is_empty() {
            return Err(RecordError::EmptyTable);
        }
        fields.remove(TAGS_KEY);
        fields.remove(UNIT_KEY);
        Ok(Self {
            destination_table,
            fields,
            tags,
            unit,
            timestamp,
        })
    }

    /// Returns `fields` with `tags` and `unit` embedded as reserved keys.
    pub fn embedded_fields(&self) -> BTreeMap<String, Value> {
        let mut fields = self.fields.clone();
        let tags = self
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<String, Value>>();
        fields.insert(TAGS_KEY.to_string(), Value::Object(tags));
        fields.insert(UNIT_KEY.to_string(), Value::String(self.unit.as_str().to_string()));
        fields
    }

    /// Rebuilds a record from a `fields` map that carries reserved keys.
    ///
    /// A missing `tags` key yields empty tags; a missing `unit` key yields seconds.
    pub fn from_embedded(
        destination_table: impl Into<String>,
        mut fields: BTreeMap<String, Value>,
        timestamp: i64,
    ) -> Result<Self, RecordError> {
        let tags = match fields.remove(TAGS_KEY) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| (k, tag_string(v)))
                .collect(),
            Some(_) => return Err(RecordError::TagsNotMap),
        };
        let unit = match fields.remove(UNIT_KEY) {
            Some(Value::String(marker)) => TimestampUnit::parse(&marker),
            _ => TimestampUnit::Seconds,
        };
        Self::new(destination_table, fields, tags, unit, timestamp)
    }

    /// Splits a dotted `schema.table` destination into its two parts.
    pub fn schema_and_table(&self) -> Option<(&str, &str)> {
        self.destination_table
            .split_once('.')
            .filter(|(schema, table)| !schema.is_empty() && !table.is_empty())
    }
}

/// Renders a tag value as a plain string (strings are not re-quoted).
pub fn tag_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn unit_marker_parsing() {
        assert_eq!(TimestampUnit::parse("s"), TimestampUnit::Seconds);
        assert_eq!(TimestampUnit::parse("u"), TimestampUnit::Micros);
        assert_eq!(TimestampUnit::parse("ms"), TimestampUnit::Micros);
    }

    #[test]
    fn new_rejects_empty_table_and_strips_reserved_keys() {
        assert_eq!(
            CanonicalRecord::new("", BTreeMap::new(), BTreeMap::new(), TimestampUnit::Seconds, 1),
            Err(RecordError::EmptyTable)
        );

        let record = CanonicalRecord::new(
            "cpu",
            fields(json!({"load": 0.5, "tags": {"a": "b"}, "unit": "u"})),
            BTreeMap::new(),
            TimestampUnit::Seconds,
            1,
        )
        .unwrap();
        assert_eq!(record.fields.len(), 1);
        assert!(record.fields.contains_key("load"));
    }

    #[test]
    fn embedded_shape_carries_tags_and_unit() {
        let record = CanonicalRecord::from_embedded(
            "temperature",
            fields(json!({"temp": 21.5, "tags": {"eqpt_no": "1900", "line": 3}, "unit": "u"})),
            1_700_000_000_000_000,
        )
        .unwrap();
        assert_eq!(record.unit, TimestampUnit::Micros);
        assert_eq!(record.tags.get("eqpt_no").map(String::as_str), Some("1900"));
        assert_eq!(record.tags.get("line").map(String::as_str), Some("3"));

        let embedded = record.embedded_fields();
        assert_eq!(embedded.get("unit"), Some(&json!("u")));
        assert_eq!(embedded.get("tags"), Some(&json!({"eqpt_no": "1900", "line": "3"})));
        assert_eq!(embedded.get("temp"), Some(&json!(21.5)));
    }

    #[test]
    fn embedded_defaults_when_reserved_keys_missing() {
        let record =
            CanonicalRecord::from_embedded("t", fields(json!({"v": 1})), 10).unwrap();
        assert!(record.tags.is_empty());
        assert_eq!(record.unit, TimestampUnit::Seconds);

        assert_eq!(
            CanonicalRecord::from_embedded("t", fields(json!({"tags": [1, 2]})), 10),
            Err(RecordError::TagsNotMap)
        );
    }

    #[test]
    fn dotted_destination_splits() {
        let record = CanonicalRecord::new(
            "plant.boiler",
            BTreeMap::new(),
            BTreeMap::new(),
            TimestampUnit::Seconds,
            0,
        )
        .unwrap();
        assert_eq!(record.schema_and_table(), Some(("plant", "boiler")));
    }
}
