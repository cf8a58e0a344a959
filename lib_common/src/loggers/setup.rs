//! # Logging Setup
//!
//! Installs the global `tracing` subscriber for the agent: a human-readable
//! console layer, an optional JSON file layer rotated daily, and the
//! [`RingLayer`](super::ring::RingLayer) feeding the control plane's log ring.

use std::io;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::ring::{LogRing, RingLayer};
use crate::configs::LogConfig;

/// File name prefix of the daily log files.
pub const LOG_FILE_PREFIX: &str = "telemetry_agent";

/// # Setup Logging
///
/// The effective filter is `RUST_LOG` when set, otherwise `level_override`,
/// otherwise `[log].level`.
///
/// # Returns
/// The file appender's `WorkerGuard` when file output is configured. The
/// caller must keep it alive for the lifetime of the process so buffered
/// lines are flushed.
pub fn setup_logging(
    config: &LogConfig,
    level_override: Option<&str>,
    ring: LogRing,
) -> io::Result<Option<WorkerGuard>> {
    let level = level_override.unwrap_or(&config.level).to_string();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(RingLayer::new(ring))
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    info!(level = %level, file = config.dir.is_some(), "logging initialized");
    Ok(guard)
}
