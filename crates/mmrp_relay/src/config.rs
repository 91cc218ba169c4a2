use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use mmrp_network::NodeConfig;
use mmrp_network::discovery::lan_address;

/// LAN discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    /// UDP port announcements are broadcast on.
    pub port: u16,
    pub interval_secs: u64,
    /// Silence after which a relay is considered gone.
    pub expiry_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9481,
            interval_secs: 5,
            expiry_secs: 15,
        }
    }
}

impl DiscoverySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs.max(self.interval_secs + 1))
    }
}

/// A relay to link to at startup without waiting for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRelay {
    pub uri: String,
    pub cluster_id: String,
}

/// Daemon configuration stored at `~/.mmrp/relay.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayDaemonConfig {
    pub node: NodeConfig,
    pub discovery: DiscoverySettings,
    pub static_relays: Vec<StaticRelay>,
    /// Defaults to `~/.mmrp/logs`.
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for RelayDaemonConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            discovery: DiscoverySettings::default(),
            static_relays: Vec::new(),
            log_dir: None,
            log_filter: "info,mmrp_network=debug,mmrp_relay=debug".to_string(),
        }
    }
}

impl RelayDaemonConfig {
    /// Returns the base directory: `~/.mmrp/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".mmrp"))
    }

    /// Returns the default config file path: `~/.mmrp/relay.json`
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("relay.json"))
    }

    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::base_dir()?.join("logs")),
        }
    }

    /// Load config from `path`, writing the defaults there if it does not exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("Invalid node config")?;
        if let Some(relay) = self.static_relays.iter().find(|r| r.uri.is_empty()) {
            anyhow::bail!("Static relay {} has no uri", relay.cluster_id);
        }
        Ok(())
    }

    /// Replace a loopback `advertise_host` with this host's LAN address when
    /// discovery is on. Every relay would otherwise announce the same
    /// unreachable uri and derive the same cluster id.
    pub async fn resolve_advertise_host(&mut self) -> Result<()> {
        if !self.announces_loopback() {
            return Ok(());
        }
        let ip = lan_address().await.context(
            "Discovery needs a LAN address; set node.advertise_host or disable discovery",
        )?;
        info!("Advertising {ip} instead of {}", self.node.advertise_host);
        self.node.advertise_host = ip.to_string();
        self.check_advertise_host()
    }

    /// Reject a loopback `advertise_host` while discovery is on.
    fn check_advertise_host(&self) -> Result<()> {
        if self.announces_loopback() {
            anyhow::bail!(
                "advertise_host {} is loopback; discovery would announce an address no other host can reach",
                self.node.advertise_host
            );
        }
        Ok(())
    }

    fn announces_loopback(&self) -> bool {
        self.discovery.enabled
            && self.node.role.is_relay()
            && is_loopback_host(&self.node.advertise_host)
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmrp_network::NodeRole;

    #[test]
    fn test_missing_file_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("etc").join("relay.json");

        let config = RelayDaemonConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert!(config.discovery.enabled);
        assert_eq!(config.node.role, NodeRole::Relay);
        assert!(config.static_relays.is_empty());
    }

    #[test]
    fn test_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{
                "node": { "cluster_id": "east", "bind_addr": "0.0.0.0:9500" },
                "discovery": { "enabled": false },
                "static_relays": [ { "uri": "ws://10.0.0.6:9480", "cluster_id": "west" } ]
            }"#,
        )
        .unwrap();

        let config = RelayDaemonConfig::load_from_path(&path).unwrap();
        assert_eq!(config.node.cluster_id.as_deref(), Some("east"));
        assert_eq!(config.node.bind_addr.port(), 9500);
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.port, 9481);
        assert_eq!(config.static_relays[0].cluster_id, "west");
    }

    #[test]
    fn test_invalid_node_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.json");
        std::fs::write(&path, r#"{ "node": { "role": "client" } }"#).unwrap();

        let err = RelayDaemonConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("cluster_id"));
    }

    #[test]
    fn test_expiry_outlives_interval() {
        let settings = DiscoverySettings {
            interval_secs: 10,
            expiry_secs: 3,
            ..DiscoverySettings::default()
        };
        assert!(settings.expiry() > settings.interval());
    }

    #[test]
    fn test_loopback_hosts() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("::1"));
        assert!(!is_loopback_host("10.0.0.5"));
        assert!(!is_loopback_host("relay-1.lan"));
    }

    #[test]
    fn test_loopback_rejected_only_with_discovery() {
        let mut config = RelayDaemonConfig::default();
        assert!(config.check_advertise_host().is_err());

        config.node.advertise_host = "10.0.0.5".to_string();
        assert!(config.check_advertise_host().is_ok());

        config.node.advertise_host = "127.0.0.1".to_string();
        config.discovery.enabled = false;
        assert!(config.check_advertise_host().is_ok());
    }

    #[tokio::test]
    async fn test_resolve_advertise_host() {
        let mut config = RelayDaemonConfig::default();
        config.node.advertise_host = "10.0.0.5".to_string();
        config.resolve_advertise_host().await.unwrap();
        assert_eq!(config.node.advertise_host, "10.0.0.5");

        // Without a route the daemon refuses to start rather than announce
        // a loopback uri.
        config.node.advertise_host = "127.0.0.1".to_string();
        match config.resolve_advertise_host().await {
            Ok(()) => assert!(!is_loopback_host(&config.node.advertise_host)),
            Err(e) => assert!(format!("{e:#}").contains("LAN address")),
        }
    }

    #[test]
    fn test_log_dir_override() {
        let config = RelayDaemonConfig {
            log_dir: Some(PathBuf::from("/var/log/mmrp")),
            ..RelayDaemonConfig::default()
        };
        assert_eq!(config.logs_dir().unwrap(), PathBuf::from("/var/log/mmrp"));
    }
}
