/// Bounded log ring and the tracing layer that fills it.
pub mod ring;
/// Global subscriber installation.
pub mod setup;

pub use ring::{LogEntry, LogRing, RingLayer, LOG_RING_CAPACITY};
pub use setup::setup_logging;
