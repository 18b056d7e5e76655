//! Configuration management for the tsnode daemon.
//!
//! Loaded from a TOML file. On first run, if no config exists, one is
//! generated with defaults next to the platform data directory. Every field
//! has a default, so partial files written by older versions still load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::constants::{discovery, transport};

/// Get the platform-specific data directory for tsnode
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\tsnode
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tsnode")
    } else {
        // Linux/Mac: ~/.tsnode
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tsnode")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port tried on first start; the bound port is persisted afterwards
    pub listen_port: u16,
    pub enable_upnp: bool,
    pub enable_bootstrap: bool,
    pub bootstrap_peer: String,
    pub reconnect_interval_secs: u64,
    pub pex_interval_secs: u64,
    /// Chance that a dead peer is retried on each reconnect scan
    pub dead_retry_probability: f64,
    pub dial_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: transport::DEFAULT_LISTEN_PORT,
            enable_upnp: true,
            enable_bootstrap: true,
            bootstrap_peer: transport::DEFAULT_BOOTSTRAP_PEER.to_string(),
            reconnect_interval_secs: discovery::RECONNECT_INTERVAL_SECS,
            pex_interval_secs: discovery::PEX_INTERVAL_SECS,
            dead_retry_probability: discovery::DEAD_RETRY_PROBABILITY,
            dial_timeout_secs: transport::DIAL_TIMEOUT_SECS,
            keep_alive_secs: transport::KEEP_ALIVE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "sled" (persistent) or "memory" (ephemeral)
    pub backend: String,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sled".to_string(),
            data_dir: String::new(), // Will be auto-configured
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/tsnode.log".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.normalize();
        Ok(config)
    }

    pub fn load_or_create(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if fs::metadata(path).is_ok() {
            Self::load_from_file(path)
        } else {
            let mut config = Config::default();
            config.normalize();
            if let Some(parent) = PathBuf::from(path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            config.save_to_file(path)?;
            tracing::info!("📝 Generated default config at {}", path);
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Fill platform paths and pull out-of-range values back into range
    pub fn normalize(&mut self) {
        if self.storage.data_dir.is_empty() {
            self.storage.data_dir = get_data_dir().to_string_lossy().to_string();
        }
        let p = self.network.dead_retry_probability;
        if !(0.0..=1.0).contains(&p) {
            tracing::warn!("dead_retry_probability {} out of range, clamping", p);
            self.network.dead_retry_probability = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        }
        if self.network.reconnect_interval_secs == 0 {
            self.network.reconnect_interval_secs = discovery::RECONNECT_INTERVAL_SECS;
        }
        if self.network.pex_interval_secs == 0 {
            self.network.pex_interval_secs = discovery::PEX_INTERVAL_SECS;
        }
        if self.network.keep_alive_secs == 0 {
            self.network.keep_alive_secs = transport::KEEP_ALIVE_SECS;
        }
        if self.network.dial_timeout_secs == 0 {
            self.network.dial_timeout_secs = transport::DIAL_TIMEOUT_SECS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[network]
listen_port = 4000
enable_upnp = false
"#,
        )
        .unwrap();
        assert_eq!(config.network.listen_port, 4000);
        assert!(!config.network.enable_upnp);
        assert_eq!(config.network.bootstrap_peer, "https://198.8.58.38:3963");
        assert_eq!(config.storage.backend, "sled");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsnode.toml");
        let path = path.to_str().unwrap();

        let created = Config::load_or_create(path).unwrap();
        assert!(std::path::Path::new(path).exists());
        assert!(!created.storage.data_dir.is_empty());

        let loaded = Config::load_from_file(path).unwrap();
        assert_eq!(loaded.network.listen_port, created.network.listen_port);
        assert_eq!(loaded.storage.data_dir, created.storage.data_dir);
    }

    #[test]
    fn test_normalize_clamps_probability() {
        let mut config = Config::default();
        config.network.dead_retry_probability = 3.0;
        config.network.reconnect_interval_secs = 0;
        config.normalize();
        assert_eq!(config.network.dead_retry_probability, 1.0);
        assert_eq!(config.network.reconnect_interval_secs, 10);
    }
}
