//! # Sinks
//!
//! One adapter per destination kind. Each adapter sits behind a cargo
//! feature; a build without the feature still parses configurations naming
//! that sink but refuses to start a transport for it.

use async_trait::async_trait;

use crate::configs::{AgentConfig, SinkKind};
use crate::transport::{SinkAdapter, SinkError, SinkFactory};

/// Time-series sink over the InfluxDB HTTP write API.
#[cfg(feature = "influx")]
pub mod influx;
/// Message-broker sink.
#[cfg(feature = "kafka")]
pub mod kafka;
/// Pub/sub bridge sink.
#[cfg(feature = "mqtt")]
pub mod mqtt;
/// Relational sink writing into TimescaleDB hypertables.
#[cfg(feature = "timescale")]
pub mod timescale;

/// Builds the adapter for `config.send_to_where`, owned by `worker`.
#[cfg_attr(not(feature = "mqtt"), allow(unused_variables))]
pub async fn build_sink(config: &AgentConfig, worker: &str) -> Result<Box<dyn SinkAdapter>, SinkError> {
    match config.send_to_where {
        #[cfg(feature = "influx")]
        SinkKind::Timeseries => Ok(Box::new(influx::InfluxSink::new(&config.influxdb)?)),
        #[cfg(feature = "kafka")]
        SinkKind::Broker => Ok(Box::new(kafka::KafkaSink::new(&config.kafka, config.reported_ip())?)),
        #[cfg(feature = "mqtt")]
        SinkKind::Pubsub => Ok(Box::new(mqtt::MqttSink::new(&config.mqtt, worker)?)),
        #[cfg(feature = "timescale")]
        SinkKind::Relational => Ok(Box::new(timescale::TimescaleSink::new(&config.timescale)?)),
        #[allow(unreachable_patterns)]
        other => Err(SinkError::Connect(format!("{} support is not compiled in", other))),
    }
}

/// The factory used in production: whatever the configuration selects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredSinks;

#[async_trait]
impl SinkFactory for ConfiguredSinks {
    async fn build(&self, config: &AgentConfig, worker: &str) -> Result<Box<dyn SinkAdapter>, SinkError> {
        build_sink(config, worker).await
    }
}

#[cfg(all(test, feature = "influx"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_the_selected_sink() {
        let config = AgentConfig {
            send_to_where: SinkKind::Timeseries,
            ..AgentConfig::default()
        };
        let sink = ConfiguredSinks.build(&config, "transport").await.unwrap();
        assert_eq!(sink.kind(), SinkKind::Timeseries);
    }
}
