//! # Transport / Fan-out
//!
//! Moves records from the reliable queue to the configured sink, one entry
//! per cycle: `Fetch -> Unpack -> Shape -> Send -> Ack`.
//!
//! ## Error policy
//! | stage  | failure                         | entry            |
//! |--------|---------------------------------|------------------|
//! | Fetch  | group missing                   | group recreated  |
//! | Fetch  | anything else                   | retried later    |
//! | Unpack | malformed payload               | left pending     |
//! | Shape  | record cannot be shaped         | left pending     |
//! | Send   | [`SinkError::Rejected`]         | acknowledged     |
//! | Send   | any other [`SinkError`]         | left pending     |
//!
//! Entries left pending come back through the pending-recovery sweep.

use async_trait::async_trait;
use thiserror::Error;

use crate::configs::{AgentConfig, SinkKind};
use crate::record::CanonicalRecord;

/// Per-sink record shaping.
pub mod shape;
/// Transport and pending-recovery workers.
pub mod worker;

pub use shape::{Point, PubsubMessage, Shaped};
pub use worker::{process_entry, run_pending_recovery, run_transport, ConsumerGate, Outcome};

/// Errors raised by a sink adapter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    /// The sink refused this record for a reason retrying cannot fix
    /// (outside the retention window, unparseable field, oversize message).
    #[error("sink rejected record: {0}")]
    Rejected(String),

    /// The record cannot be shaped for this sink.
    #[error("cannot shape record: {0}")]
    Shape(String),

    /// The write failed in transit.
    #[error("sink transport error: {0}")]
    Transport(String),

    /// The sink could not be reached or set up.
    #[error("sink connect error: {0}")]
    Connect(String),
}

impl SinkError {
    /// Whether the record is dropped on purpose and its entry acknowledged.
    pub fn is_policy_drop(&self) -> bool {
        matches!(self, SinkError::Rejected(_))
    }
}

/// # Sink Adapter
///
/// A destination-specific writer. Every transport worker owns its adapter.
#[async_trait]
pub trait SinkAdapter: Send {
    fn kind(&self) -> SinkKind;

    /// Converts a record into this sink's payload. Broker sinks supply their
    /// own packer.
    fn shape(&self, record: &CanonicalRecord) -> Result<Shaped, SinkError> {
        shape::default_shape(self.kind(), record)
    }

    async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError>;
}

/// # Sink Factory
///
/// Builds the adapter for the sink selected by the configuration. `worker`
/// names the worker that owns the adapter; sinks holding a session per
/// client use it to keep their connections apart.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn build(&self, config: &AgentConfig, worker: &str) -> Result<Box<dyn SinkAdapter>, SinkError>;
}
