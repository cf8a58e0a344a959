//! # Plugin Registry
//!
//! Maps `[probe].kind` and `[normalizer].kind` to constructors. The built-in
//! kinds are registered by [`PluginRegistry::default`]; embedding code adds
//! deployment-specific ones with [`PluginRegistry::register_probe`] and
//! [`PluginRegistry::register_normalizer`].

use std::collections::BTreeMap;
use std::sync::Arc;

use super::normalizer::{FieldsNormalizer, JsonNormalizer, Normalizer};
use super::probe::{CommandProbe, Probe};
use super::{NormalizeError, ProbeError};
use crate::configs::AgentConfig;

pub type ProbeConstructor = Arc<dyn Fn(&AgentConfig) -> Result<Box<dyn Probe>, ProbeError> + Send + Sync>;
pub type NormalizerConstructor =
    Arc<dyn Fn(&AgentConfig) -> Result<Box<dyn Normalizer>, NormalizeError> + Send + Sync>;

/// # Plugin Registry
#[derive(Clone)]
pub struct PluginRegistry {
    probes: BTreeMap<String, ProbeConstructor>,
    normalizers: BTreeMap<String, NormalizerConstructor>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_probe("command", |config| {
            Ok(Box::new(CommandProbe::new(config.probe.command.clone())?) as Box<dyn Probe>)
        });
        #[cfg(feature = "mqtt")]
        registry.register_probe("mqtt", |config| {
            Ok(Box::new(super::probe::MqttProbe::new(config.mqtt.clone())?) as Box<dyn Probe>)
        });
        registry.register_normalizer("json", |_| Ok(Box::new(JsonNormalizer) as Box<dyn Normalizer>));
        registry.register_normalizer("fields", |config| {
            Ok(Box::new(FieldsNormalizer::new(config.normalizer.delimiter.clone())) as Box<dyn Normalizer>)
        });
        registry
    }
}

impl PluginRegistry {
    /// A registry without any kinds.
    pub fn empty() -> Self {
        Self {
            probes: BTreeMap::new(),
            normalizers: BTreeMap::new(),
        }
    }

    pub fn register_probe<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&AgentConfig) -> Result<Box<dyn Probe>, ProbeError> + Send + Sync + 'static,
    {
        self.probes.insert(kind.into(), Arc::new(constructor));
    }

    pub fn register_normalizer<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&AgentConfig) -> Result<Box<dyn Normalizer>, NormalizeError> + Send + Sync + 'static,
    {
        self.normalizers.insert(kind.into(), Arc::new(constructor));
    }

    pub fn build_probe(&self, config: &AgentConfig) -> Result<Box<dyn Probe>, ProbeError> {
        let constructor = self
            .probes
            .get(&config.probe.kind)
            .ok_or_else(|| ProbeError::Unknown(config.probe.kind.clone()))?;
        constructor(config)
    }

    pub fn build_normalizer(&self, config: &AgentConfig) -> Result<Box<dyn Normalizer>, NormalizeError> {
        let constructor = self
            .normalizers
            .get(&config.normalizer.kind)
            .ok_or_else(|| NormalizeError::Unknown(config.normalizer.kind.clone()))?;
        constructor(config)
    }

    pub fn probe_kinds(&self) -> impl Iterator<Item = &str> {
        self.probes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds_resolve_and_unknown_kinds_fail() {
        let registry = PluginRegistry::default();
        let mut config = AgentConfig::default();
        config.probe.command = "echo 1".to_string();
        assert!(registry.build_probe(&config).is_ok());
        assert!(registry.build_normalizer(&config).is_ok());

        config.probe.kind = "snmp".to_string();
        assert!(matches!(registry.build_probe(&config), Err(ProbeError::Unknown(kind)) if kind == "snmp"));
        config.normalizer.kind = "fields".to_string();
        assert!(registry.build_normalizer(&config).is_ok());
    }

    #[test]
    fn custom_probe_can_be_registered() {
        struct Fixed;
        #[async_trait::async_trait]
        impl Probe for Fixed {
            async fn produce(&mut self) -> Result<super::super::Readings, ProbeError> {
                Ok(super::super::Readings::One(serde_json::json!({"data_value": [1]})))
            }
        }
        let mut registry = PluginRegistry::empty();
        registry.register_probe("fixed", |_| Ok(Box::new(Fixed) as Box<dyn Probe>));
        let mut config = AgentConfig::default();
        config.probe.kind = "fixed".to_string();
        assert!(registry.build_probe(&config).is_ok());
        assert_eq!(registry.probe_kinds().collect::<Vec<_>>(), vec!["fixed"]);
    }
}
