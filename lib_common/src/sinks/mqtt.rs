//! # MQTT Sink
//!
//! Publishes each message as JSON to every configured topic. The client's
//! event loop runs on its own task for as long as the sink lives.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::configs::{MqttConfig, SinkKind};
use crate::transport::{Shaped, SinkAdapter, SinkError};

/// Maps a numeric QoS level; anything above 2 is treated as 2.
pub fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Client id of the sink owned by `worker`. The broker keeps one session per
/// id, so every worker connects under its own.
pub fn client_id(config: &MqttConfig, worker: &str) -> String {
    if config.client_id.is_empty() {
        format!("telemetry-sink-{}-{}", std::process::id(), worker)
    } else {
        format!("{}-{}", config.client_id, worker)
    }
}

/// # MQTT Sink
pub struct MqttSink {
    client: AsyncClient,
    pump: JoinHandle<()>,
    topics: Vec<String>,
    qos: QoS,
}

impl MqttSink {
    pub fn new(config: &MqttConfig, worker: &str) -> Result<Self, SinkError> {
        if config.topics.is_empty() {
            return Err(SinkError::Connect("mqtt.topics is empty".to_string()));
        }
        let mut options = MqttOptions::new(client_id(config, worker), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let pump = tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    warn!(sink = "mqtt", error = %e, "connection error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        Ok(Self {
            client,
            pump,
            topics: config.topics.clone(),
            qos: qos_from(config.qos),
        })
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl SinkAdapter for MqttSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Pubsub
    }

    async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError> {
        let Shaped::Message(message) = shaped else {
            return Err(SinkError::Shape("mqtt sink expects a message".to_string()));
        };
        let payload = serde_json::to_vec(&message).map_err(|e| SinkError::Shape(e.to_string()))?;
        for topic in &self.topics {
            self.client
                .publish(topic.clone(), self.qos, false, payload.clone())
                .await
                .map_err(|e| SinkError::Transport(e.to_string()))?;
            debug!(sink = "mqtt", topic = %topic, bytes = payload.len(), "message published");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn sink_without_topics_is_refused() {
        assert!(MqttSink::new(&MqttConfig::default(), "transport").is_err());
    }

    #[test]
    fn each_worker_connects_under_its_own_client_id() {
        let mut config = MqttConfig::default();
        let transport = client_id(&config, "transport");
        let pending = client_id(&config, "pending");
        assert_ne!(transport, pending);
        assert!(transport.ends_with("-transport"));

        config.client_id = "edge-7".to_string();
        assert_eq!(client_id(&config, "transport"), "edge-7-transport");
        assert_eq!(client_id(&config, "pending"), "edge-7-pending");
    }
}
