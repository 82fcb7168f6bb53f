//! Persisted ghost mode state.
//!
//! Owned by the ghost module but read by client creation (to attach
//! connection hints) and the network migrator (as a blocker).

use std::path::Path;

use chrono::{DateTime, Utc};
use phantom_system::fs::{self, PRIVATE_MODE};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Port the tunnel terminates TLS on.
pub const GHOST_PORT: u16 = 443;

/// Everything ghost mode touched, so disable can undo it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostChanges {
    /// Files written.
    pub files_created: Vec<String>,
    /// Binaries installed.
    pub packages_installed: Vec<String>,
    /// systemd units added.
    pub services_added: Vec<String>,
    /// Filter rules added, as human-readable descriptions.
    pub firewall_modified: Vec<String>,
    /// Whether the WireGuard port was restricted to loopback.
    pub wireguard_restricted: bool,
    /// Certificate domains obtained.
    pub certificates_created: Vec<String>,
}

/// `ghost-state.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostState {
    /// Whether ghost mode is on.
    pub enabled: bool,
    /// Detected public address.
    pub server_ip: String,
    /// Domain the certificate was issued for.
    pub domain: String,
    /// Upgrade path prefix clients must present.
    pub secret: String,
    /// When installation started.
    pub installed_at: DateTime<Utc>,
    /// When the tunnel became active.
    pub activated_at: Option<DateTime<Utc>>,
    /// Change log for rollback.
    #[serde(default)]
    pub changes: GhostChanges,
}

impl GhostState {
    /// Reads the state file; `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or corrupt.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        Ok(fs::read_json(path)?)
    }

    /// Writes the state file with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write_json(path, self, PRIVATE_MODE)?;
        Ok(())
    }

    /// Deletes the state file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(path: &Path) -> Result<bool> {
        Ok(fs::remove_file(path)?)
    }

    /// Returns true if a state file says ghost mode is on. Unreadable state
    /// counts as off.
    #[must_use]
    pub fn is_enabled(path: &Path) -> bool {
        matches!(Self::load(path), Ok(Some(state)) if state.enabled)
    }

    /// Client-side command for this tunnel.
    #[must_use]
    pub fn connection_command(&self) -> String {
        connection_command(&self.secret, &self.domain)
    }
}

/// `wstunnel client` invocation that forwards local UDP 51820 through the
/// tunnel.
#[must_use]
pub fn connection_command(secret: &str, domain: &str) -> String {
    format!(
        "wstunnel client --http-upgrade-path-prefix \"{secret}\" -L udp://127.0.0.1:51820:127.0.0.1:51820 wss://{domain}:{GHOST_PORT}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GhostState {
        GhostState {
            enabled: true,
            server_ip: "203.0.113.10".to_string(),
            domain: "vpn.example.com".to_string(),
            secret: "s3cr3t".to_string(),
            installed_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            activated_at: None,
            changes: GhostChanges::default(),
        }
    }

    #[test]
    fn command_format() {
        assert_eq!(
            state().connection_command(),
            "wstunnel client --http-upgrade-path-prefix \"s3cr3t\" -L udp://127.0.0.1:51820:127.0.0.1:51820 wss://vpn.example.com:443"
        );
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config/ghost-state.json");
        assert!(!GhostState::is_enabled(&path));

        let mut st = state();
        st.changes.files_created.push("/etc/systemd/system/wstunnel.service".to_string());
        st.save(&path).expect("save");
        assert!(GhostState::is_enabled(&path));
        assert_eq!(GhostState::load(&path).expect("load"), Some(st));

        assert!(GhostState::remove(&path).expect("remove"));
        assert!(!GhostState::is_enabled(&path));
    }
}
