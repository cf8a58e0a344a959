//! # Remote Store
//!
//! Hierarchical key writes under `/nodes/<node>/<app>/...`, used for status
//! publication and artifact upload. [`EtcdStore`] talks to the etcd v2 keys
//! API over HTTP; [`MemoryStore`] keeps everything in process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::configs::EtcdConfig;

/// Errors raised by a remote store.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request could not be sent or timed out.
    #[error("remote store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("remote store returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A local artifact could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// # Remote Store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), RemoteError>;
}

/// Key prefix for one node and application.
pub fn node_prefix(node: &str, application: &str) -> String {
    format!("/nodes/{}/{}", node, application)
}

/// Namespace of an uploaded artifact, chosen by file extension.
pub fn artifact_kind(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => "conf",
        Some("lua") => "lua",
        _ => "code",
    }
}

/// # Etcd Store
///
/// `PUT {endpoint}/v2/keys{key}` with a form-encoded `value`.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    endpoint: String,
}

impl EtcdStore {
    pub fn new(config: &EtcdConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Builds the store for a config, `None` when no endpoint is configured.
    pub fn from_config(config: &EtcdConfig) -> Result<Option<Arc<dyn RemoteStore>>, RemoteError> {
        if config.endpoint.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(Self::new(config)?)))
    }
}

#[async_trait]
impl RemoteStore for EtcdStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), RemoteError> {
        let url = format!("{}/v2/keys{}", self.endpoint, key);
        let response = self.client.put(&url).form(&[("value", value)]).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// In-process remote store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn get(&self, key: &str) -> Option<String> {
        match self.entries.lock() {
            Ok(entries) => entries.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), RemoteError> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_namespace_by_extension() {
        assert_eq!(artifact_kind(Path::new("/etc/agent/agent.toml")), "conf");
        assert_eq!(artifact_kind(Path::new("enqueue.lua")), "lua");
        assert_eq!(artifact_kind(Path::new("plugin.py")), "code");
        assert_eq!(artifact_kind(Path::new("noext")), "code");
        assert_eq!(node_prefix("n1", "collector"), "/nodes/n1/collector");
    }

    #[test]
    fn empty_endpoint_disables_remote_writes() {
        assert!(EtcdStore::from_config(&EtcdConfig::default()).unwrap().is_none());
        let configured = EtcdConfig {
            endpoint: "http://127.0.0.1:2379/".to_string(),
            ..EtcdConfig::default()
        };
        assert!(EtcdStore::from_config(&configured).unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_store_keeps_latest_value() {
        let store = MemoryStore::default();
        store.put("/a", "1").await.unwrap();
        store.put("/a", "2").await.unwrap();
        assert_eq!(store.get("/a").as_deref(), Some("2"));
        assert_eq!(store.keys(), vec!["/a".to_string()]);
    }
}
