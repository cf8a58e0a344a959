//! # Probes
//!
//! A probe yields raw readings: one value, a batch, or a lazy stream that may
//! be unbounded. The probe loop forwards every reading to the raw channel and
//! pauses for the configured interval between invocations.
//!
//! A stream is drained until it ends; it is never restarted. The next
//! invocation of [`Probe::produce`] decides what comes after it.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ProbeError;

/// Output of one probe invocation.
pub enum Readings {
    One(Value),
    Many(Vec<Value>),
    /// A lazy sequence, finite or not.
    Stream(BoxStream<'static, Value>),
}

/// # Probe
#[async_trait]
pub trait Probe: Send {
    async fn produce(&mut self) -> Result<Readings, ProbeError>;
}

/// # Run Probe
///
/// Runs until `cancel` fires. Invocation errors are logged and the loop
/// carries on after the interval.
pub async fn run_probe(
    mut probe: Box<dyn Probe>,
    raw_tx: UnboundedSender<Value>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(worker = "probe", "started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let produced = tokio::select! {
            _ = cancel.cancelled() => break,
            produced = probe.produce() => produced,
        };
        match produced {
            Ok(Readings::One(value)) => forward(&raw_tx, value),
            Ok(Readings::Many(values)) => values.into_iter().for_each(|v| forward(&raw_tx, v)),
            Ok(Readings::Stream(mut stream)) => loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = stream.next() => next,
                };
                match next {
                    Some(value) => forward(&raw_tx, value),
                    None => break,
                }
            },
            Err(e) => warn!(worker = "probe", error = %e, "probe invocation failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(worker = "probe", "stopped");
}

fn forward(raw_tx: &UnboundedSender<Value>, value: Value) {
    if raw_tx.send(value).is_err() {
        warn!(worker = "probe", "raw channel closed, reading discarded");
    }
}

/// # Command Probe
///
/// Runs a shell command per invocation and yields one reading per non-empty
/// stdout line. Lines that parse as JSON become JSON values, the rest are
/// passed on as strings.
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Result<Self, ProbeError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(ProbeError::Setup("probe.command is empty".to_string()));
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn produce(&mut self) -> Result<Readings, ProbeError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Run(format!("spawn '{}': {}", self.command, e)))?;
        if !output.status.success() {
            return Err(ProbeError::Run(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let readings: Vec<Value> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())))
            .collect();
        debug!(worker = "probe", count = readings.len(), "command produced readings");
        Ok(Readings::Many(readings))
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt_probe::MqttProbe;

#[cfg(feature = "mqtt")]
mod mqtt_probe {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use super::{ProbeError, Probe, Readings};
    use crate::configs::MqttConfig;
    use crate::sinks::mqtt::qos_from;

    /// # MQTT Probe
    ///
    /// Subscribes to the configured topics and yields every inbound payload
    /// as an unbounded stream. JSON payloads are decoded, other payloads are
    /// passed on as UTF-8 strings.
    pub struct MqttProbe {
        config: MqttConfig,
    }

    impl MqttProbe {
        pub fn new(config: MqttConfig) -> Result<Self, ProbeError> {
            if config.topics.is_empty() {
                return Err(ProbeError::Setup("mqtt.topics is empty".to_string()));
            }
            Ok(Self { config })
        }
    }

    #[async_trait]
    impl Probe for MqttProbe {
        async fn produce(&mut self) -> Result<Readings, ProbeError> {
            let client_id = if self.config.client_id.is_empty() {
                format!("telemetry-probe-{}", std::process::id())
            } else {
                format!("{}-probe", self.config.client_id)
            };
            let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
            options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs.max(5)));
            if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
                options.set_credentials(user.clone(), pass.clone());
            }
            let (client, mut eventloop) = AsyncClient::new(options, 64);
            let qos = qos_from(self.config.qos);
            for topic in &self.config.topics {
                client
                    .subscribe(topic.clone(), qos)
                    .await
                    .map_err(|e| ProbeError::Setup(e.to_string()))?;
            }

            let (tx, rx) = mpsc::unbounded_channel::<Value>();
            tokio::spawn(async move {
                // Keeps the client alive for as long as the pump runs.
                let _client = client;
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let value = serde_json::from_slice(&publish.payload).unwrap_or_else(|_| {
                                Value::String(String::from_utf8_lossy(&publish.payload).into_owned())
                            });
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(worker = "probe", error = %e, "mqtt subscription lost");
                            break;
                        }
                    }
                }
                info!(worker = "probe", "mqtt subscription ended");
            });

            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|value| (value, rx))
            });
            Ok(Readings::Stream(stream.boxed()))
        }
    }
}
