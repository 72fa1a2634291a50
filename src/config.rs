//! TOML configuration.
//!
//! Every key is optional; a missing file section falls back to its
//! defaults. Command line flags are applied on top by the binary.

use crate::error::{Result, XdisError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Empty means authentication is not enforced.
    pub auth_password: String,
    /// Seconds of silence after which a connection is closed; 0 disables.
    pub conn_keepalive_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6666,
            auth_password: String::new(),
            conn_keepalive_interval: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub databases: usize,
    pub slot_count: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            slot_count: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub slowlog_threshold_us: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            slowlog_threshold_us: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            XdisError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| XdisError::Config(format!("'{}': {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| XdisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.storage.databases == 0 {
            return Err(XdisError::Config(
                "storage.databases must be at least 1".to_string(),
            ));
        }
        if self.storage.slot_count == 0 {
            return Err(XdisError::Config(
                "storage.slot_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            addr: self.addr(),
            auth_password: Some(self.server.auth_password.clone()).filter(|p| !p.is_empty()),
            conn_keepalive_interval: Duration::from_secs(self.server.conn_keepalive_interval),
            slowlog_threshold: Duration::from_micros(self.logging.slowlog_threshold_us),
        }
    }
}

/// Runtime options of the dispatch service.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Listen address, reported by INFO.
    pub addr: String,
    pub auth_password: Option<String>,
    /// Zero disables the idle close.
    pub conn_keepalive_interval: Duration,
    pub slowlog_threshold: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Config::default().service_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.addr(), "127.0.0.1:6666");
        assert_eq!(config.storage.databases, 16);
        assert_eq!(config.storage.slot_count, 1024);

        let opts = config.service_options();
        assert_eq!(opts.auth_password, None);
        assert!(opts.conn_keepalive_interval.is_zero());
        assert_eq!(opts.slowlog_threshold, Duration::from_millis(10));
    }

    #[test]
    fn test_partial_file() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 7000
            auth_password = "secret"
            conn_keepalive_interval = 30

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.slowlog_threshold_us, 10_000);

        let opts = config.service_options();
        assert_eq!(opts.auth_password.as_deref(), Some("secret"));
        assert_eq!(opts.conn_keepalive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            Config::from_toml("[server]\nport = \"x\""),
            Err(XdisError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[storage]\ndatabases = 0"),
            Err(XdisError::Config(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\ndatabases = 4\nslot_count = 16").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.storage.databases, 4);
        assert_eq!(config.storage.slot_count, 16);

        let missing = file.path().with_extension("missing");
        assert!(Config::load(&missing).is_err());
    }
}
