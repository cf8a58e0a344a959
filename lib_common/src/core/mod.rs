//! # Core Engine Module
//!
//! Keeps the agent's workers alive.
//!
//! ## Core Components:
//!
//! - **`supervisor`**: the monitor loop. Every interval it compares the
//!   worker names the current configuration expects against the tasks that
//!   are still running, respawns the missing ones and acts on the control
//!   plane's `restart` and `reload` flags. Workers are stopped cooperatively
//!   through a per-worker cancellation token and a bounded join.
//!
//! - **`workers`**: the production roster. It maps every worker name to the
//!   loop it runs and the shared resources it binds to (pipeline channels,
//!   broker connector, sink factory, remote store).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monitor loop restarting dead or flagged workers.
pub mod supervisor;
/// The agent's worker roster.
pub mod workers;

pub use supervisor::{Supervisor, WorkerFactory, WorkerSpec};
pub use workers::AgentWorkers;

/// Role a worker plays; restart counters are kept per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Probe,
    Normalizer,
    Admitter,
    Transport,
    Control,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerRole::Probe => "probe",
            WorkerRole::Normalizer => "normalizer",
            WorkerRole::Admitter => "admitter",
            WorkerRole::Transport => "transport",
            WorkerRole::Control => "control",
        };
        f.write_str(name)
    }
}
