//! # Kafka Sink
//!
//! Packs each record into the broker envelope and produces it to one topic,
//! waiting for the delivery report.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::debug;

use crate::configs::{KafkaConfig, SinkKind};
use crate::record::CanonicalRecord;
use crate::transport::shape::broker_envelope;
use crate::transport::{Shaped, SinkAdapter, SinkError};

/// # Kafka Sink
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    ip: String,
    org: i64,
    dataid: i64,
    wait: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, ip: &str) -> Result<Self, SinkError> {
        let wait = Duration::from_secs(config.delivery_timeout_secs.max(1));
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", wait.as_millis().to_string())
            .create()
            .map_err(|e| SinkError::Connect(e.to_string()))?;
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            ip: ip.to_string(),
            org: config.org,
            dataid: config.dataid,
            wait,
        })
    }
}

/// Delivery failures no retry can fix.
pub fn classify(error: &KafkaError) -> SinkError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge)
        | Some(RDKafkaErrorCode::InvalidMessageSize)
        | Some(RDKafkaErrorCode::InvalidMessage) => SinkError::Rejected(error.to_string()),
        _ => SinkError::Transport(error.to_string()),
    }
}

#[async_trait]
impl SinkAdapter for KafkaSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Broker
    }

    fn shape(&self, record: &CanonicalRecord) -> Result<Shaped, SinkError> {
        Ok(Shaped::Envelope(broker_envelope(record, &self.ip, self.dataid, self.org)))
    }

    async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError> {
        let Shaped::Envelope(envelope) = shaped else {
            return Err(SinkError::Shape("kafka sink expects an envelope".to_string()));
        };
        let payload = serde_json::to_vec(&envelope).map_err(|e| SinkError::Shape(e.to_string()))?;
        let record = FutureRecord::<(), _>::to(&self.topic).payload(&payload);
        match self.producer.send(record, Timeout::After(self.wait)).await {
            Ok(delivery) => {
                debug!(sink = "kafka", topic = %self.topic, delivery = ?delivery, "message delivered");
                Ok(())
            }
            Err((e, _)) => Err(classify(&e)),
        }
    }
}
