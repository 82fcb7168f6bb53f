//! Runtime settings: where things live and how long to wait for them.
//!
//! `Settings` is built once by the binary and shared read-only by every
//! module through [`Context`](crate::Context).

use std::path::{Path, PathBuf};
use std::time::Duration;

use phantom_system::Poll;

/// Default installation root.
pub const DEFAULT_INSTALL_DIR: &str = "/opt/phantom-wg";

/// Filesystem layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    /// Installation root holding config, data, logs and exits.
    pub install_dir: PathBuf,
    /// Directory of `wg-quick` interface files.
    pub wireguard_dir: PathBuf,
    /// systemd unit directory.
    pub systemd_dir: PathBuf,
    /// systemd-networkd directory.
    pub networkd_dir: PathBuf,
    /// iproute2 routing table names file.
    pub rt_tables: PathBuf,
    /// ACME client state directory.
    pub letsencrypt_dir: PathBuf,
    /// Where the tunnel binary is installed.
    pub wstunnel_dir: PathBuf,
    /// Scratch space for downloads.
    pub tmp_dir: PathBuf,
}

impl Paths {
    /// Standard system layout with the given install root.
    #[must_use]
    pub fn system(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            networkd_dir: PathBuf::from("/etc/systemd/network"),
            rt_tables: PathBuf::from("/etc/iproute2/rt_tables"),
            letsencrypt_dir: PathBuf::from("/etc/letsencrypt"),
            wstunnel_dir: PathBuf::from("/opt/wstunnel"),
            tmp_dir: PathBuf::from("/tmp"),
        }
    }

    /// The standard layout relocated under `root`.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            install_dir: root.join("opt/phantom-wg"),
            wireguard_dir: root.join("etc/wireguard"),
            systemd_dir: root.join("etc/systemd/system"),
            networkd_dir: root.join("etc/systemd/network"),
            rt_tables: root.join("etc/iproute2/rt_tables"),
            letsencrypt_dir: root.join("etc/letsencrypt"),
            wstunnel_dir: root.join("opt/wstunnel"),
            tmp_dir: root.join("tmp"),
        }
    }

    /// `config/` under the install root.
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.install_dir.join("config")
    }

    /// `data/` under the install root.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.install_dir.join("data")
    }

    /// `logs/` under the install root.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.install_dir.join("logs")
    }

    /// Imported multihop exits.
    #[must_use]
    pub fn exit_configs_dir(&self) -> PathBuf {
        self.install_dir.join("exit_configs")
    }

    /// Subnet migration snapshots.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.install_dir.join("backups")
    }

    /// Exported client configurations.
    #[must_use]
    pub fn clients_dir(&self) -> PathBuf {
        self.install_dir.join("clients")
    }

    /// `phantom.json`.
    #[must_use]
    pub fn phantom_json(&self) -> PathBuf {
        self.config_dir().join("phantom.json")
    }

    /// Ghost mode state file.
    #[must_use]
    pub fn ghost_state(&self) -> PathBuf {
        self.config_dir().join("ghost-state.json")
    }

    /// Client and IP allocation database.
    #[must_use]
    pub fn clients_db(&self) -> PathBuf {
        self.data_dir().join("clients.json")
    }

    /// Live multihop session log.
    #[must_use]
    pub fn session_log(&self) -> PathBuf {
        self.logs_dir().join("multihop-session-current.log")
    }

    /// `wg-quick` file for an interface.
    #[must_use]
    pub fn wg_config(&self, interface: &str) -> PathBuf {
        self.wireguard_dir.join(format!("{interface}.conf"))
    }

    /// Exported config for a client.
    #[must_use]
    pub fn client_config(&self, name: &str) -> PathBuf {
        self.clients_dir().join(format!("{name}.conf"))
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::system(DEFAULT_INSTALL_DIR)
    }
}

/// Waits applied to external state changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for a systemd unit to report `active`.
    pub service_start: Poll,
    /// Waiting for the multihop exit handshake.
    pub handshake: Poll,
    /// Waiting for the interface to come back after a subnet change.
    pub migration_verify: Poll,
    /// Pause between stopping and starting services.
    pub settle: Duration,
}

impl Timeouts {
    /// Short waits for tests driven by a scripted executor.
    #[must_use]
    pub const fn fast() -> Self {
        let quick = Poll::new(Duration::from_millis(40), Duration::from_millis(5));
        Self {
            service_start: quick,
            handshake: quick,
            migration_verify: quick,
            settle: Duration::ZERO,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            service_start: Poll::new(Duration::from_secs(10), Duration::from_millis(500)),
            handshake: Poll::new(Duration::from_secs(30), Duration::from_secs(1)),
            migration_verify: Poll::new(Duration::from_secs(15), Duration::from_secs(1)),
            settle: Duration::from_secs(2),
        }
    }
}

/// Process-wide settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Filesystem layout.
    pub paths: Paths,
    /// Waits.
    pub timeouts: Timeouts,
    /// Use self-signed certificates instead of ACME.
    pub test_mode: bool,
    /// Command that runs the multihop monitor, written into its unit file.
    pub monitor_exec: String,
}

impl Settings {
    /// Settings for the given install root.
    #[must_use]
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            timeouts: Timeouts::default(),
            test_mode: false,
            monitor_exec: "/usr/local/bin/phantom monitor".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(Paths::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths() {
        let paths = Paths::system("/opt/phantom-wg");
        assert_eq!(
            paths.phantom_json(),
            PathBuf::from("/opt/phantom-wg/config/phantom.json")
        );
        assert_eq!(paths.wg_config("wg_main"), PathBuf::from("/etc/wireguard/wg_main.conf"));
        assert_eq!(
            paths.session_log(),
            PathBuf::from("/opt/phantom-wg/logs/multihop-session-current.log")
        );
    }

    #[test]
    fn relocated_paths_stay_under_root() {
        let root = Path::new("/tmp/sandbox");
        let paths = Paths::under(root);
        for p in [
            &paths.install_dir,
            &paths.wireguard_dir,
            &paths.systemd_dir,
            &paths.networkd_dir,
            &paths.rt_tables,
            &paths.letsencrypt_dir,
            &paths.wstunnel_dir,
        ] {
            assert!(p.starts_with(root), "{}", p.display());
        }
    }
}
