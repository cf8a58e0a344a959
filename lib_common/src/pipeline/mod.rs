//! # Ingestion Pipeline
//!
//! Probe -> Normalizer -> Admitter, three independent loops joined by
//! in-process channels and ending in a [`ReliableQueue`](crate::queue::ReliableQueue)
//! admission.
//!
//! The raw channel is unbounded: a probe is never slowed down by a lagging
//! normalizer, and the channel grows instead. The normalized channel is
//! bounded by `[pipeline].normalized_capacity`.
//!
//! Both receivers sit behind an `Arc<tokio::sync::Mutex<_>>` so a worker
//! respawned by the supervisor binds to the very same channel and nothing
//! buffered is lost across a restart.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::record::CanonicalRecord;

/// Admission loop.
pub mod admitter;
/// Normalizer trait, built-in normalizers and the normalizer loop.
pub mod normalizer;
/// Name -> constructor registry for probes and normalizers.
pub mod plugins;
/// Probe trait, built-in probes and the probe loop.
pub mod probe;

pub use admitter::run_admitter;
pub use normalizer::{run_normalizer, DataValue, HandlerOutput, Normalizer, NormalizerDefaults};
pub use plugins::PluginRegistry;
pub use probe::{run_probe, Probe, Readings};

/// Errors raised by a probe invocation.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe kind is not registered.
    #[error("unknown probe kind '{0}'")]
    Unknown(String),

    /// The probe could not be started.
    #[error("probe setup failed: {0}")]
    Setup(String),

    /// One invocation failed. The loop logs it and tries again.
    #[error("probe run failed: {0}")]
    Run(String),
}

/// Errors raised while normalizing one raw value.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The normalizer kind is not registered.
    #[error("unknown normalizer kind '{0}'")]
    Unknown(String),

    /// The raw value or handler output does not have the documented shape.
    #[error("unexpected shape: {0}")]
    Shape(String),

    /// The resulting record violates a record invariant.
    #[error(transparent)]
    Record(#[from] crate::record::RecordError),
}

/// # Pipeline Channels
///
/// The shared channel set every pipeline worker binds to. Cloning yields
/// handles to the same channels.
#[derive(Clone)]
pub struct PipelineChannels {
    pub raw_tx: mpsc::UnboundedSender<Value>,
    pub raw_rx: Arc<Mutex<mpsc::UnboundedReceiver<Value>>>,
    pub normalized_tx: mpsc::Sender<CanonicalRecord>,
    pub normalized_rx: Arc<Mutex<mpsc::Receiver<CanonicalRecord>>>,
}

impl PipelineChannels {
    pub fn new(normalized_capacity: usize) -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (normalized_tx, normalized_rx) = mpsc::channel(normalized_capacity.max(1));
        Self {
            raw_tx,
            raw_rx: Arc::new(Mutex::new(raw_rx)),
            normalized_tx,
            normalized_rx: Arc::new(Mutex::new(normalized_rx)),
        }
    }
}
