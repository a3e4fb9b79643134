//! Daemon configuration.
//!
//! Settings come from an optional TOML file overlaid with environment
//! variables prefixed `ROOKERY__`, using a double underscore between path
//! segments:
//!
//! ```bash
//! ROOKERY__INSTANCE_ID=node-1
//! ROOKERY__STORAGE__KIND=libsql
//! ROOKERY__STORAGE__PATH=/var/lib/rookery/rookery.db
//! ROOKERY__XMPP__DEFAULT_HOST=jackal.im
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rookery_xmpp::config::{serde_duration, XmppServerConfig};
use serde::Deserialize;
use tracing::info;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ROOKERY";

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Process memory; lost on restart
    #[default]
    Memory,
    /// libSQL database file
    Libsql,
}

/// Storage section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Database file for `libsql`
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: PathBuf::from("rookery.db"),
        }
    }
}

/// Cluster section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Events buffered per KV watcher before it must resynchronise
    pub watch_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            watch_capacity: 1024,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Cluster-unique instance identifier
    pub instance_id: String,
    pub storage: StorageConfig,
    pub cluster: ClusterConfig,
    pub xmpp: XmppServerConfig,
    /// Time granted to open streams on shutdown
    #[serde(with = "serde_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            storage: StorageConfig::default(),
            cluster: ClusterConfig::default(),
            xmpp: XmppServerConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Load `path` (if given) and overlay the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        let config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize::<ServerConfig>()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(instance_id = %self.instance_id, "Instance");
        info!(default_host = %self.xmpp.default_host, hosts = self.xmpp.hosts.len(), "Hosts");
        match self.storage.kind {
            StorageKind::Memory => info!("Storage: memory (not persistent)"),
            StorageKind::Libsql => info!(path = %self.storage.path.display(), "Storage: libsql"),
        }
        for listener in &self.xmpp.listeners {
            info!(
                addr = %listener.bind_addr,
                port = listener.port,
                transport = %listener.transport,
                direct_tls = listener.direct_tls,
                "C2S listener"
            );
        }
        info!(modules = ?self.xmpp.modules.enabled, "Modules");
        info!(shutdown_timeout = ?self.shutdown_timeout, "Shutdown timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(!config.instance_id.is_empty());
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rookery.toml");
        std::fs::write(
            &path,
            r#"
instance_id = "node-1"
shutdown_timeout = "10s"

[storage]
kind = "libsql"
path = "/tmp/rookery.db"

[xmpp]
default_host = "jackal.im"

[[xmpp.listeners]]
port = 5223
direct_tls = true
resource_conflict = "terminate_old"
auth_timeout = "5s"

[xmpp.modules]
enabled = ["roster", "ping"]

[xmpp.modules.ping]
send_pings = true
interval = "1m"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.instance_id, "node-1");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.storage.kind, StorageKind::Libsql);
        assert_eq!(config.xmpp.default_host, "jackal.im");
        assert_eq!(config.xmpp.listeners.len(), 1);
        assert_eq!(config.xmpp.listeners[0].port, 5223);
        assert!(config.xmpp.listeners[0].direct_tls);
        assert_eq!(config.xmpp.listeners[0].auth_timeout, Duration::from_secs(5));
        assert_eq!(config.xmpp.modules.enabled, vec!["roster", "ping"]);
        assert!(config.xmpp.modules.ping.send_pings);
        assert_eq!(config.xmpp.modules.ping.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
