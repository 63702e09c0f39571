//! Node configuration file management.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use whitenoise_types::{PeerId, ServiceMode};

/// Complete node configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Privacy settings.
    #[serde(default)]
    pub privacy: PrivacyConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Bootstrap peers, `"<base58-peer-id>@<host:port>"`.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Node mode: "server" | "client" | "boot".
    #[serde(default = "default_mode")]
    pub mode: ServiceMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_peers: Vec::new(),
            mode: default_mode(),
        }
    }
}

/// Privacy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Peer allowlist (base58 peer ids). Empty = admit everyone. Read once
    /// at startup; admission is gated in the host's connection hook.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_mode() -> ServiceMode {
    ServiceMode::Server
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A parsed bootstrap entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub id: PeerId,
    pub addr: String,
}

impl NodeConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Parse the configured bootstrap entries, skipping malformed ones.
    pub fn bootstrap_peers(&self) -> Vec<BootstrapPeer> {
        self.network
            .bootstrap_peers
            .iter()
            .filter_map(|entry| {
                let (id, addr) = entry.split_once('@')?;
                Some(BootstrapPeer {
                    id: id.parse().ok()?,
                    addr: addr.to_string(),
                })
            })
            .collect()
    }

    /// The parsed allowlist; `None` when the whitelist is empty (admit
    /// everyone).
    pub fn allowlist(&self) -> Option<HashSet<PeerId>> {
        if self.privacy.whitelist.is_empty() {
            return None;
        }
        Some(
            self.privacy
                .whitelist
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.network.mode, ServiceMode::Server);
        assert_eq!(config.network.listen_port, 0);
        assert!(config.allowlist().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let id = PeerId([7u8; 32]).to_base58();
        let raw = format!(
            r#"
            [network]
            listen_port = 4001
            mode = "client"
            bootstrap_peers = ["{id}@10.0.0.1:4001", "garbage-entry"]

            [privacy]
            whitelist = ["{id}"]

            [log]
            level = "debug"
            "#
        );
        let config: NodeConfig = toml::from_str(&raw).expect("parse");
        assert_eq!(config.network.mode, ServiceMode::Client);
        assert_eq!(config.network.listen_port, 4001);
        assert_eq!(config.log.level, "debug");

        let boots = config.bootstrap_peers();
        assert_eq!(boots.len(), 1);
        assert_eq!(boots[0].addr, "10.0.0.1:4001");

        let allow = config.allowlist().expect("allowlist");
        assert!(allow.contains(&PeerId([7u8; 32])));
    }
}
