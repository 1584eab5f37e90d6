//! Node configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration.
//!
//! ```toml
//! [tunnel]
//! mtu = 1280
//! statistics_interval_ms = 1000
//! listen_port = 0
//! dns = ["1.1.1.1"]
//! routes = ["0.0.0.0/0"]
//!
//! [history]
//! path = "session-history.json"
//!
//! [log]
//! level = "info"
//! ```

use dvpn_tunnel::{ConfigError, Subnet, TunnelOptions, DEFAULT_MTU};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Node configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub tunnel: TunnelSection,
    pub history: HistorySection,
    pub log: LogSection,
}

/// `[tunnel]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub mtu: u16,
    pub statistics_interval_ms: u64,
    /// 0 lets the device pick
    pub listen_port: u16,
    pub dns: Vec<IpAddr>,
    pub routes: Vec<Subnet>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            statistics_interval_ms: 1000,
            listen_port: 0,
            dns: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// `[history]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// JSON file holding past sessions
    pub path: PathBuf,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("session-history.json"),
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Default filter directive, `RUST_LOG` wins when set
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, NodeConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| NodeConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded node config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML
    pub fn from_toml_str(content: &str) -> Result<Self, NodeConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the tunnel cannot run with
    pub fn validate(&self) -> Result<(), NodeConfigError> {
        self.tunnel_options().validate()?;
        if self.log.level.trim().is_empty() {
            return Err(NodeConfigError::EmptyLogLevel);
        }
        Ok(())
    }

    /// Tunnel options for connection factories
    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            mtu: self.tunnel.mtu,
            statistics_interval: Duration::from_millis(self.tunnel.statistics_interval_ms),
            listen_port: self.tunnel.listen_port,
            dns: self.tunnel.dns.clone(),
            routes: self.tunnel.routes.clone(),
            session_name: None,
        }
    }
}

/// Config loading errors
#[derive(Debug, thiserror::Error)]
pub enum NodeConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Tunnel(#[from] ConfigError),

    #[error("Log level must not be empty")]
    EmptyLogLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.tunnel_options(), TunnelOptions::default());
        assert_eq!(config.history.path, PathBuf::from("session-history.json"));
    }

    #[test]
    fn test_full_config() {
        let config = NodeConfig::from_toml_str(
            r#"
            [tunnel]
            mtu = 1420
            statistics_interval_ms = 250
            listen_port = 51820
            dns = ["1.1.1.1", "2606:4700:4700::1111"]
            routes = ["0.0.0.0/0", "10.8.0.0/16"]

            [history]
            path = "/var/lib/dvpn/history.json"

            [log]
            level = "dvpn_tunnel=debug"
            "#,
        )
        .unwrap();

        let options = config.tunnel_options();
        assert_eq!(options.mtu, 1420);
        assert_eq!(options.statistics_interval, Duration::from_millis(250));
        assert_eq!(options.listen_port, 51820);
        assert_eq!(options.dns.len(), 2);
        assert_eq!(options.routes[1].to_string(), "10.8.0.0/16");
        assert_eq!(config.log.level, "dvpn_tunnel=debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str("[tunnel]\nmtu = 500"),
            Err(NodeConfigError::Tunnel(ConfigError::InvalidMtu(500)))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("[tunnel]\nstatistics_interval_ms = 0"),
            Err(NodeConfigError::Tunnel(ConfigError::ZeroInterval))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("[tunnel]\nroutes = [\"10.0.0.0/40\"]"),
            Err(NodeConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("[log]\nlevel = \" \""),
            Err(NodeConfigError::EmptyLogLevel)
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = NodeConfig::load(Path::new("/nonexistent/dvpn-node.toml")).unwrap_err();
        assert!(matches!(err, NodeConfigError::Read { .. }));
    }
}
