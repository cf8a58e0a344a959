//! # Agent Configuration
//!
//! The structured TOML file describing one agent node: which roles it runs,
//! where the broker lives, how probes and the normalizer behave, which sink
//! the transport fans out to, and the credentials for that sink.
//!
//! Every section carries `#[serde(default)]`, so a minimal file only needs
//! `node` and the credentials for the selected sink.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the expected shape.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A credential required by the selected sink is missing.
    #[error("missing required credential '{field}' for sink '{sink}'")]
    MissingCredential {
        /// Sink selection that needs the credential.
        sink: SinkKind,
        /// Name of the missing key.
        field: &'static str,
    },

    /// The selected sink was compiled out of this build.
    #[error("sink '{0}' is not available in this build (feature disabled)")]
    SinkUnavailable(SinkKind),

    /// Any other invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Destination kind selected by `send_to_where`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Time-series database (InfluxDB).
    #[default]
    #[serde(alias = "influxdb")]
    Timeseries,
    /// Message broker (Kafka).
    #[serde(alias = "kafka")]
    Broker,
    /// Pub/sub bridge (MQTT).
    #[serde(alias = "mqtt")]
    Pubsub,
    /// Relational time-series store (TimescaleDB).
    #[serde(alias = "timescale")]
    Relational,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkKind::Timeseries => "timeseries",
            SinkKind::Broker => "broker",
            SinkKind::Pubsub => "pubsub",
            SinkKind::Relational => "relational",
        };
        f.write_str(name)
    }
}

impl SinkKind {
    /// Whether this build carries the adapter for the sink.
    pub fn compiled_in(&self) -> bool {
        match self {
            SinkKind::Timeseries => cfg!(feature = "influx"),
            SinkKind::Broker => cfg!(feature = "kafka"),
            SinkKind::Pubsub => cfg!(feature = "mqtt"),
            SinkKind::Relational => cfg!(feature = "timescale"),
        }
    }
}

/// Groups of workers a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Probe, normalizer and admitter.
    Collector,
    /// Transport and pending recovery.
    Transport,
}

/// # Agent Config
///
/// Root of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Node identifier used in status snapshots and remote key paths.
    pub node: String,
    /// Application name used in remote key paths (`/nodes/<node>/<application>`).
    pub application: String,
    /// Address reported in status and the broker envelope. Detected when absent.
    pub local_ip: Option<String>,
    /// Worker groups this node runs.
    pub roles: Vec<NodeRole>,
    /// Sink the transport writes to.
    pub send_to_where: SinkKind,
    pub redis: RedisConfig,
    pub stream: StreamConfig,
    pub pipeline: PipelineConfig,
    pub probe: ProbeConfig,
    pub normalizer: NormalizerConfig,
    pub control: ControlConfig,
    pub supervisor: SupervisorConfig,
    pub etcd: EtcdConfig,
    pub http: HttpConfig,
    pub log: LogConfig,
    pub influxdb: InfluxConfig,
    pub kafka: KafkaConfig,
    pub mqtt: MqttConfig,
    pub timescale: TimescaleConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            application: "collector".to_string(),
            local_ip: None,
            roles: vec![NodeRole::Collector, NodeRole::Transport],
            send_to_where: SinkKind::default(),
            redis: RedisConfig::default(),
            stream: StreamConfig::default(),
            pipeline: PipelineConfig::default(),
            probe: ProbeConfig::default(),
            normalizer: NormalizerConfig::default(),
            control: ControlConfig::default(),
            supervisor: SupervisorConfig::default(),
            etcd: EtcdConfig::default(),
            http: HttpConfig::default(),
            log: LogConfig::default(),
            influxdb: InfluxConfig::default(),
            kafka: KafkaConfig::default(),
            mqtt: MqttConfig::default(),
            timescale: TimescaleConfig::default(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    /// Logical database index.
    pub db: i64,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    /// Fixed delay between connection attempts.
    pub retry_backoff_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            connect_timeout_secs: 5,
            retry_backoff_secs: 2,
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by the `redis` crate. The password is
    /// percent-encoded; the crate decodes it again when parsing.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Reliable queue layout on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream key records are admitted to.
    pub key: String,
    /// Consumer group used by the transport.
    pub group: String,
    /// Consumer name inside the group. Must be stable across restarts so
    /// pending entries are recovered by the next instance.
    pub consumer: String,
    /// Upper bound for a blocking consume, in milliseconds.
    pub block_ms: u64,
    /// Approximate stream length cap applied on admission.
    pub max_len: u64,
    /// List key carrying control commands.
    pub command_key: String,
    /// Key of the short-lived local status cache.
    pub status_key: String,
    /// Hash key holding the latest status of every node.
    pub node_status_key: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            key: "data_stream".to_string(),
            group: "transport".to_string(),
            consumer: "transport-0".to_string(),
            block_ms: 2_000,
            max_len: 100_000,
            command_key: "order_name".to_string(),
            status_key: "status".to_string(),
            node_status_key: "node_status".to_string(),
        }
    }
}

impl StreamConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }
}

/// In-process pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the normalized -> admitter channel.
    pub normalized_capacity: usize,
    /// Sleep between transport cycles when the queue is empty or failing.
    pub retry_backoff_secs: u64,
    /// Interval of the pending-recovery sweep.
    pub pending_interval_secs: u64,
    /// Log every admitted record at info level.
    pub enqueue_log: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalized_capacity: 1024,
            retry_backoff_secs: 3,
            pending_interval_secs: 5,
            enqueue_log: false,
        }
    }
}

/// Probe selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `command` or `mqtt`, or any name registered by embedding code.
    pub kind: String,
    /// Shell command run by the `command` probe.
    pub command: String,
    /// Pause between probe invocations.
    pub interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: "command".to_string(),
            command: String::new(),
            interval_secs: 5,
        }
    }
}

/// Normalizer selection and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// `json` or `fields`.
    pub kind: String,
    /// Names zipped against list-shaped `data_value`s.
    pub field_name_list: Vec<String>,
    /// Table used when the handler output has no `table_name`.
    pub table_name: String,
    /// Timestamp unit marker: `"s"` for seconds, anything else microseconds.
    pub unit: String,
    /// Separator used by the `fields` normalizer.
    pub delimiter: String,
    /// Tags attached to every record (handler tags win on conflict).
    pub default_tags: BTreeMap<String, String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            kind: "json".to_string(),
            field_name_list: Vec::new(),
            table_name: "telemetry".to_string(),
            unit: "s".to_string(),
            delimiter: ",".to_string(),
            default_tags: BTreeMap::new(),
        }
    }
}

/// Control plane timing and upload paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub command_interval_ms: u64,
    pub publish_interval_secs: u64,
    pub status_ttl_secs: u64,
    /// Local artifacts uploaded on `upload` and watched by the change monitor.
    pub paths: Vec<PathBuf>,
    pub monitor_files: bool,
    pub monitor_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_interval_ms: 500,
            publish_interval_secs: 600,
            status_ttl_secs: 300,
            paths: Vec::new(),
            monitor_files: false,
            monitor_interval_secs: 30,
        }
    }
}

/// Supervisor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_secs: u64,
    /// Grace period for a cancelled worker before it is abandoned.
    pub join_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            join_timeout_secs: 5,
        }
    }
}

/// Remote key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Base URL. Empty disables remote writes.
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: 5,
        }
    }
}

/// HTTP control/status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    /// Seconds `/status` waits for a fresh snapshot.
    pub status_wait_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8000".to_string(),
            status_wait_secs: 3,
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Directory for daily rolling JSON files. Absent means console only.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: Option<String>,
    pub retention_policy: Option<String>,
    pub timeout_secs: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8086,
            username: None,
            password: None,
            db: None,
            retention_policy: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub org: i64,
    pub dataid: i64,
    pub delivery_timeout_secs: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: "default".to_string(),
            org: 3101,
            dataid: 0,
            delivery_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    /// 0, 1 or 2.
    pub qos: u8,
    pub topics: Vec<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            keepalive_secs: 60,
            qos: 2,
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimescaleConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub schema_name: String,
    pub hypertable_name: String,
    pub time_field: String,
    /// Column name -> `int` | `float` | `str`.
    pub columns: BTreeMap<String, String>,
    pub pool_size: usize,
}

impl Default for TimescaleConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: None,
            password: None,
            dbname: None,
            schema_name: "device_tables".to_string(),
            hypertable_name: "device_data".to_string(),
            time_field: "recordtime".to_string(),
            columns: BTreeMap::new(),
            pool_size: 4,
        }
    }
}

impl AgentConfig {
    /// Parses a configuration document.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: AgentConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.fill_defaults();
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Resolves values that depend on the host.
    fn fill_defaults(&mut self) {
        if self.node.trim().is_empty() {
            if let Ok(name) = hostname::get() {
                self.node = name.to_string_lossy().to_string();
            }
        }
        if self.local_ip.is_none() {
            self.local_ip = local_ip_address::local_ip().ok().map(|ip: IpAddr| ip.to_string());
        }
    }

    /// Address reported to sinks and status, `127.0.0.1` when undetectable.
    pub fn reported_ip(&self) -> &str {
        self.local_ip.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn runs(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Checks for fatal configuration errors.
    ///
    /// Only the credentials of the selected sink are required, and only when
    /// this node runs the transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.trim().is_empty() {
            return Err(ConfigError::Invalid("node id is empty".to_string()));
        }
        if self.roles.is_empty() {
            return Err(ConfigError::Invalid("no roles configured".to_string()));
        }
        if self.normalizer.table_name.trim().is_empty() {
            return Err(ConfigError::Invalid("normalizer.table_name is empty".to_string()));
        }
        if !self.runs(NodeRole::Transport) {
            return Ok(());
        }

        let sink = self.send_to_where;
        if !sink.compiled_in() {
            return Err(ConfigError::SinkUnavailable(sink));
        }
        let require = |value: &Option<String>, field: &'static str| match value {
            Some(v) if !v.is_empty() => Ok(()),
            _ => Err(ConfigError::MissingCredential { sink, field }),
        };

        match sink {
            SinkKind::Timeseries => {
                require(&self.influxdb.username, "influxdb.username")?;
                require(&self.influxdb.password, "influxdb.password")?;
                require(&self.influxdb.db, "influxdb.db")?;
            }
            SinkKind::Broker => {
                if self.kafka.bootstrap_servers.trim().is_empty() {
                    return Err(ConfigError::MissingCredential {
                        sink,
                        field: "kafka.bootstrap_servers",
                    });
                }
            }
            SinkKind::Pubsub => {
                if self.mqtt.topics.is_empty() {
                    return Err(ConfigError::Invalid("mqtt.topics is empty".to_string()));
                }
                if self.mqtt.qos > 2 {
                    return Err(ConfigError::Invalid(format!("mqtt.qos {} out of range", self.mqtt.qos)));
                }
            }
            SinkKind::Relational => {
                require(&self.timescale.user, "timescale.user")?;
                require(&self.timescale.password, "timescale.password")?;
                require(&self.timescale.dbname, "timescale.dbname")?;
            }
        }
        Ok(())
    }
}

/// # Config Source
///
/// Remembers where the configuration came from so a reload can re-read it.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A TOML file on disk.
    File(PathBuf),
    /// A fixed, in-memory configuration (tests, embedded use).
    Fixed(Box<AgentConfig>),
    /// Another source with the node id forced, e.g. from the command line.
    NodeOverride { source: Box<ConfigSource>, node: String },
}

impl ConfigSource {
    /// Wraps the source so every load reports `node` as the node id.
    pub fn with_node(self, node: impl Into<String>) -> Self {
        ConfigSource::NodeOverride {
            source: Box::new(self),
            node: node.into(),
        }
    }

    pub fn load(&self) -> Result<AgentConfig, ConfigError> {
        match self {
            ConfigSource::File(path) => AgentConfig::load(path),
            ConfigSource::Fixed(config) => Ok((**config).clone()),
            ConfigSource::NodeOverride { source, node } => {
                let mut config = source.load()?;
                config.node = node.clone();
                Ok(config)
            }
        }
    }
}
