//! # Control Plane
//!
//! The one deliberately shared object of an agent process. It is built once
//! at startup and handed to every component as an `Arc<ControlPlane>`.
//!
//! It holds:
//! - the current configuration and where to reload it from;
//! - the last record seen per destination table, restart counters per role
//!   and the names of live workers, behind a single mutex;
//! - the bounded log ring fed by the tracing layer;
//! - the `reload` and `restart` flags observed by the supervisor.
//!
//! The loops that bridge it to the broker and the remote store live in
//! [`loops`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::configs::{AgentConfig, ConfigError, ConfigSource};
use crate::core::WorkerRole;
use crate::loggers::{LogEntry, LogRing};
use crate::record::CanonicalRecord;

/// Command, publication and change-monitor loops.
pub mod loops;
/// Remote key-value store used for status publication and artifact upload.
pub mod remote;

pub use loops::{run_change_monitor, run_command_loop, run_publish_loop};
pub use remote::{EtcdStore, MemoryStore, RemoteError, RemoteStore};

/// # Status Snapshot
///
/// Point-in-time view of a node, written to the local status cache, the
/// node-status hash and the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub node_id: String,
    pub ip: String,
    pub last_known_data: BTreeMap<String, CanonicalRecord>,
    pub recent_log_ring: Vec<LogEntry>,
    pub restart_counts_by_role: BTreeMap<WorkerRole, u64>,
    pub live_worker_names: BTreeSet<String>,
    /// Records skipped at admission as byte-identical repeats, per table.
    #[serde(default)]
    pub duplicates_by_table: BTreeMap<String, u64>,
}

#[derive(Default)]
struct ControlState {
    last_known_data: BTreeMap<String, CanonicalRecord>,
    restart_counts: BTreeMap<WorkerRole, u64>,
    live_workers: BTreeSet<String>,
    duplicates: BTreeMap<String, u64>,
}

/// # Control Plane
pub struct ControlPlane {
    source: ConfigSource,
    config: RwLock<Arc<AgentConfig>>,
    state: Mutex<ControlState>,
    log: LogRing,
    reload_requested: AtomicBool,
    restart_requested: AtomicBool,
}

impl ControlPlane {
    /// Builds the control plane from an already loaded configuration.
    pub fn new(source: ConfigSource, config: AgentConfig, log: LogRing) -> Arc<Self> {
        Arc::new(Self {
            source,
            config: RwLock::new(Arc::new(config)),
            state: Mutex::new(ControlState::default()),
            log,
            reload_requested: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
        })
    }

    /// A control plane over a fixed configuration and a private log ring.
    pub fn with_config(config: AgentConfig) -> Arc<Self> {
        Self::new(ConfigSource::Fixed(Box::new(config.clone())), config, LogRing::default())
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> Arc<AgentConfig> {
        match self.config.read() {
            Ok(config) => Arc::clone(&config),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-reads the configuration source and swaps it in.
    ///
    /// The previous configuration stays in effect when the new one does not
    /// load or validate.
    pub fn reload_config(&self) -> Result<Arc<AgentConfig>, ConfigError> {
        let fresh = self.source.load()?;
        fresh.validate()?;
        let fresh = Arc::new(fresh);
        match self.config.write() {
            Ok(mut config) => *config = Arc::clone(&fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&fresh),
        }
        info!(node = %fresh.node, sink = %fresh.send_to_where, "configuration reloaded");
        Ok(fresh)
    }

    /// Remembers the latest record seen for its destination table.
    pub fn record_data(&self, record: &CanonicalRecord) {
        self.lock()
            .last_known_data
            .insert(record.destination_table.clone(), record.clone());
    }

    /// Counts a record skipped as a repeat of the previous one for its table.
    pub fn record_duplicate(&self, record: &CanonicalRecord) {
        *self
            .lock()
            .duplicates
            .entry(record.destination_table.clone())
            .or_insert(0) += 1;
    }

    /// Appends a line to the bounded log ring.
    pub fn enqueue_log(&self, level: &str, message: impl Into<String>) {
        self.log.push(LogEntry::new(level, "control", message));
    }

    pub fn log_ring(&self) -> &LogRing {
        &self.log
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
    }

    /// Returns and clears the reload flag.
    pub fn take_reload(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    /// Returns and clears the restart flag.
    pub fn take_restart(&self) -> bool {
        self.restart_requested.swap(false, Ordering::SeqCst)
    }

    pub fn reload_pending(&self) -> bool {
        self.reload_requested.load(Ordering::SeqCst)
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    pub fn count_restart(&self, role: WorkerRole) {
        *self.lock().restart_counts.entry(role).or_default() += 1;
    }

    pub fn restart_count(&self, role: WorkerRole) -> u64 {
        self.lock().restart_counts.get(&role).copied().unwrap_or(0)
    }

    pub fn set_live_workers<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().live_workers = names.into_iter().map(Into::into).collect();
    }

    /// Builds a snapshot of the node.
    pub fn snapshot(&self) -> StatusSnapshot {
        let config = self.config();
        let state = self.lock();
        StatusSnapshot {
            node_id: config.node.clone(),
            ip: config.reported_ip().to_string(),
            last_known_data: state.last_known_data.clone(),
            recent_log_ring: self.log.snapshot(),
            restart_counts_by_role: state.restart_counts.clone(),
            live_worker_names: state.live_workers.clone(),
            duplicates_by_table: state.duplicates.clone(),
        }
    }
}
