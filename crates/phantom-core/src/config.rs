//! `phantom.json`: the persisted server configuration.
//!
//! Unknown keys are kept so fields written by other tools survive a
//! load/save cycle.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use phantom_system::fs::{self, PRIVATE_MODE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PhantomError, Result};

/// Name of the main WireGuard interface when none is configured.
pub const DEFAULT_INTERFACE: &str = "wg_main";

/// Default WireGuard listen port.
pub const DEFAULT_PORT: u16 = 51820;

/// Top-level `phantom.json` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhantomConfig {
    /// Installed release.
    #[serde(default = "default_version")]
    pub version: String,
    /// Main interface settings.
    #[serde(default)]
    pub wireguard: WireguardSection,
    /// Public address details.
    #[serde(default)]
    pub server: ServerSection,
    /// DNS servers handed to clients.
    #[serde(default)]
    pub dns: DnsSection,
    /// Boolean behaviour switches.
    #[serde(default)]
    pub tweaks: BTreeMap<String, bool>,
    /// Multihop session state.
    #[serde(default)]
    pub multihop: MultihopState,
    /// Keys this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// `wireguard` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardSection {
    /// Main interface name.
    pub interface: String,
    /// UDP listen port.
    pub port: u16,
    /// Client subnet.
    pub network: Ipv4Net,
    /// Public address clients connect to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    /// Alternative public endpoint host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// MTU written to client configs.
    pub mtu: u16,
    /// Keepalive written to client configs.
    pub keepalive: u16,
}

impl Default for WireguardSection {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            port: DEFAULT_PORT,
            network: Ipv4Net::new(Ipv4Addr::new(10, 8, 0, 0), 24).unwrap_or_default(),
            server_ip: None,
            endpoint: None,
            mtu: 1420,
            keepalive: 25,
        }
    }
}

/// `server` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Public IP detected at install time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// `dns` section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// Primary resolver.
    pub primary: Ipv4Addr,
    /// Secondary resolver.
    pub secondary: Ipv4Addr,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            primary: Ipv4Addr::new(8, 8, 8, 8),
            secondary: Ipv4Addr::new(1, 1, 1, 1),
        }
    }
}

/// `multihop` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultihopState {
    /// Whether traffic is routed through an exit.
    pub enabled: bool,
    /// Name of the exit in use.
    pub active_exit: Option<String>,
    /// Secondary interface name.
    pub vpn_interface_name: Option<String>,
    /// Last state change.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PhantomConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            wireguard: WireguardSection::default(),
            server: ServerSection::default(),
            dns: DnsSection::default(),
            tweaks: BTreeMap::new(),
            multihop: MultihopState::default(),
            extra: Map::new(),
        }
    }
}

impl PhantomConfig {
    /// Loads the file, falling back to defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, not JSON, or invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = fs::read_json(path)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Writes the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write_json(path, self, PRIVATE_MODE)?;
        Ok(())
    }

    /// Checks invariants not expressed by the types.
    ///
    /// # Errors
    ///
    /// Returns [`PhantomError::Config`] on the first violation.
    pub fn validate(&self) -> Result<()> {
        let iface = &self.wireguard.interface;
        if iface.is_empty()
            || iface.len() > 15
            || !iface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(PhantomError::Config(format!(
                "wireguard.interface '{iface}' is not a valid interface name"
            )));
        }
        if self.wireguard.port == 0 {
            return Err(PhantomError::Config(
                "wireguard.port must be greater than 0".to_string(),
            ));
        }
        if self.wireguard.network.prefix_len() > 30 {
            return Err(PhantomError::Config(format!(
                "wireguard.network {} is too small",
                self.wireguard.network
            )));
        }
        Ok(())
    }

    /// Main interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.wireguard.interface
    }

    /// Host clients should connect to, in order of preference.
    #[must_use]
    pub fn endpoint_host(&self) -> &str {
        self.wireguard
            .server_ip
            .as_deref()
            .or(self.server.ip.as_deref())
            .or(self.wireguard.endpoint.as_deref())
            .filter(|h| !h.is_empty())
            .unwrap_or("YOUR_SERVER_IP")
    }

    /// Reads a tweak, falling back to its registered default.
    #[must_use]
    pub fn tweak(&self, name: &str) -> bool {
        self.tweaks
            .get(name)
            .copied()
            .or_else(|| crate::tweaks::default_value(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PhantomConfig::load(&dir.path().join("phantom.json")).expect("defaults");
        assert_eq!(config.interface(), "wg_main");
        assert_eq!(config.wireguard.network.to_string(), "10.8.0.0/24");
        assert_eq!(config.dns.primary, Ipv4Addr::new(8, 8, 8, 8));
        assert!(!config.multihop.enabled);
    }

    #[test]
    fn unknown_keys_survive_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("phantom.json");
        std::fs::write(
            &path,
            json!({
                "version": "1.0.0",
                "wireguard": {"interface": "wg_main", "port": 51820, "network": "10.9.0.0/24"},
                "installer": {"completed": true}
            })
            .to_string(),
        )
        .expect("seed");

        let config = PhantomConfig::load(&path).expect("load");
        assert_eq!(config.wireguard.network.to_string(), "10.9.0.0/24");
        config.save(&path).expect("save");

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).expect("read"))
            .expect("json");
        assert_eq!(raw["installer"]["completed"], json!(true));
    }

    #[test]
    fn invalid_interface_rejected() {
        let mut config = PhantomConfig::default();
        config.wireguard.interface = "wg main; rm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn endpoint_host_preference() {
        let mut config = PhantomConfig::default();
        assert_eq!(config.endpoint_host(), "YOUR_SERVER_IP");
        config.wireguard.endpoint = Some("vpn.example.com".to_string());
        assert_eq!(config.endpoint_host(), "vpn.example.com");
        config.server.ip = Some("198.51.100.4".to_string());
        assert_eq!(config.endpoint_host(), "198.51.100.4");
        config.wireguard.server_ip = Some("203.0.113.10".to_string());
        assert_eq!(config.endpoint_host(), "203.0.113.10");
    }
}
