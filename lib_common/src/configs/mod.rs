//! # Configuration Modules
//!
//! This module holds the agent's TOML configuration model and the source it
//! is (re)loaded from.

/// Provides the agent configuration model, validation and reload source.
pub mod agent_config;

pub use agent_config::*;
