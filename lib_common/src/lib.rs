//! # lib_common
//!
//! Engine of the telemetry collection agent.
//!
//! Data flows one way: probe -> normalizer -> admitter -> reliable queue ->
//! transport -> sink adapter. Control flows the other way: command ->
//! control plane -> supervisor -> worker restart or reload.

#![forbid(unsafe_code)]

// Declare the modules to re-export
pub mod configs;
pub mod control;
pub mod core;
pub mod loggers;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod sinks;
pub mod transport;

// Re-export the types most callers need
pub use configs::{AgentConfig, ConfigError, ConfigSource, NodeRole, SinkKind};
pub use control::{ControlPlane, StatusSnapshot};
pub use core::{AgentWorkers, Supervisor, WorkerRole};
pub use loggers::{setup_logging, LogEntry, LogRing};
pub use record::{CanonicalRecord, TimestampUnit};
