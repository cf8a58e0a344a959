//! # Log Ring
//!
//! A fixed-capacity FIFO of the most recent problems reported by the agent,
//! plus the [`RingLayer`] that feeds it from `tracing` WARN and ERROR events.
//!
//! The ring carries its own lock so the layer can append while another thread
//! holds the control plane state lock and logs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Number of entries kept by the ring.
pub const LOG_RING_CAPACITY: usize = 10;

/// One line in the ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
        }
    }
}

/// # Log Ring
///
/// Cloneable handle to a bounded ring buffer. Appending beyond the capacity
/// evicts the oldest entry, so a snapshot always holds the most recent
/// entries oldest-first.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::with_capacity(LOG_RING_CAPACITY)
    }
}

impl fmt::Debug for LogRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl LogRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Appends an entry, evicting the oldest one on overflow.
    pub fn push(&self, entry: LogEntry) {
        let mut ring = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Copies the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        match self.inner.lock() {
            Ok(ring) => ring.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(ring) => ring.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// # Ring Layer
///
/// A `tracing_subscriber` layer that copies every WARN and ERROR event into a
/// [`LogRing`].
pub struct RingLayer {
    ring: LogRing,
}

impl RingLayer {
    pub fn new(ring: LogRing) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater.
        if *metadata.level() > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.ring.push(LogEntry::new(
            metadata.level().as_str(),
            metadata.target(),
            visitor.finish(),
        ));
    }
}

/// Collects the `message` field followed by `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    extras: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.extras.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.extras.join(" ")
        } else {
            format!("{} {}", self.message, self.extras.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extras.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.extras.push(format!("{}={:?}", field.name(), value));
        }
    }
}
