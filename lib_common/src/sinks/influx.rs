//! # InfluxDB Sink
//!
//! Writes points in line protocol to `POST /write` (InfluxDB 1.x API).
//! A `400` whose body names a retention or parse problem is a policy drop;
//! every other failure leaves the entry pending.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::configs::{InfluxConfig, SinkKind};
use crate::record::TimestampUnit;
use crate::transport::{Point, Shaped, SinkAdapter, SinkError};

/// Error fragments after which retrying is pointless.
const REJECTION_MARKERS: [&str; 3] = ["beyond retention policy", "unable to parse", "field type conflict"];

/// # Influx Sink
pub struct InfluxSink {
    client: reqwest::Client,
    url: String,
    config: InfluxConfig,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| SinkError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("http://{}:{}/write", config.host, config.port),
            config: config.clone(),
        })
    }

    fn query(&self, unit: TimestampUnit) -> Vec<(&'static str, String)> {
        let mut query = vec![("precision", precision(unit).to_string())];
        let optional = [
            ("db", &self.config.db),
            ("rp", &self.config.retention_policy),
            ("u", &self.config.username),
            ("p", &self.config.password),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                query.push((key, value.clone()));
            }
        }
        query
    }

    async fn write(&self, unit: TimestampUnit, body: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .query(&self.query(unit))
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify(status.as_u16(), &text))
    }
}

#[async_trait]
impl SinkAdapter for InfluxSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Timeseries
    }

    async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError> {
        let Shaped::Points(points) = shaped else {
            return Err(SinkError::Shape("influx sink expects points".to_string()));
        };
        let mut by_unit: BTreeMap<&'static str, (TimestampUnit, Vec<String>)> = BTreeMap::new();
        for point in &points {
            by_unit
                .entry(precision(point.unit))
                .or_insert_with(|| (point.unit, Vec::new()))
                .1
                .push(line(point)?);
        }
        for (unit, lines) in by_unit.into_values() {
            debug!(sink = "influx", lines = lines.len(), "writing points");
            self.write(unit, lines.join("\n")).await?;
        }
        Ok(())
    }
}

fn precision(unit: TimestampUnit) -> &'static str {
    match unit {
        TimestampUnit::Seconds => "s",
        TimestampUnit::Micros => "u",
    }
}

/// Maps a failed write response to the error policy.
pub fn classify(status: u16, body: &str) -> SinkError {
    if status == 400 && REJECTION_MARKERS.iter().any(|marker| body.contains(marker)) {
        SinkError::Rejected(body.trim().to_string())
    } else {
        SinkError::Transport(format!("HTTP {}: {}", status, body.trim()))
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(format!("{}i", n)),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(format!("\"{}\"", escape(s, &['"']))),
        nested => Some(format!("\"{}\"", escape(&nested.to_string(), &['"']))),
    }
}

/// Encodes one point as a line-protocol line. Null fields are skipped; a
/// point left without fields is rejected.
pub fn line(point: &Point) -> Result<String, SinkError> {
    let mut out = escape(&point.measurement, &[',', ' ']);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        out.push(',');
        out.push_str(&escape(key, &[',', '=', ' ']));
        out.push('=');
        out.push_str(&escape(value, &[',', '=', ' ']));
    }
    let fields: Vec<String> = point
        .fields
        .iter()
        .filter_map(|(key, value)| field_value(value).map(|v| format!("{}={}", escape(key, &[',', '=', ' ']), v)))
        .collect();
    if fields.is_empty() {
        return Err(SinkError::Rejected(format!("point '{}' has no writable fields", point.measurement)));
    }
    out.push(' ');
    out.push_str(&fields.join(","));
    out.push(' ');
    out.push_str(&point.time.to_string());
    Ok(out)
}
