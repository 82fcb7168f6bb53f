//! Imported upstream exits under `exit_configs/`.
//!
//! Each exit is three files: the enhanced `<name>.conf`, the untouched
//! `<name>.conf.backup` and `<name>.json` metadata.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use phantom_core::{Context, PhantomError, Result};
use phantom_system::fs::{self, PRIVATE_MODE};
use phantom_wireguard::{enhance_keepalive, parse_wg_config, InterfaceConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// File stems that say nothing about the exit.
pub const GENERIC_NAMES: &[&str] = &["wg", "client", "config"];

/// Provider recorded for imported exits.
pub const DEFAULT_PROVIDER: &str = "Phantom-WG";

const ROUTE_ALL_WARNING: &str =
    "Config may not route all traffic (AllowedIPs doesn't include 0.0.0.0/0)";

/// `<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMetadata {
    /// Exit name.
    pub name: String,
    /// Import time.
    pub imported_at: DateTime<Utc>,
    /// File the config was imported from.
    pub original_path: String,
    /// Copy of the config as imported.
    pub backup_path: String,
    /// Enhanced config used for the tunnel.
    pub config_file: String,
    /// Provider label.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Changes made for multihop use.
    #[serde(default)]
    pub optimizations_applied: Vec<String>,
    /// Whether the keepalive pass ran.
    #[serde(default)]
    pub multihop_enhanced: bool,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

/// Result of `import_vpn_config`.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    /// Name the exit was stored under.
    pub config_name: String,
    /// Backup of the imported file.
    pub backup_path: String,
    /// Stored metadata.
    pub metadata: ExitMetadata,
    /// Changes made for multihop use.
    pub optimizations: Vec<String>,
    /// Non-fatal problems with the config.
    pub warnings: Vec<String>,
    /// Summary.
    pub message: String,
}

/// One row of `list_exits`.
#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    /// Exit name.
    pub name: String,
    /// Peer endpoint or `Unknown`.
    pub endpoint: String,
    /// Whether multihop currently uses this exit.
    pub active: bool,
    /// Provider label.
    pub provider: String,
    /// Import time, if metadata exists.
    pub imported_at: Option<DateTime<Utc>>,
    /// Whether the keepalive pass ran.
    pub multihop_enhanced: bool,
}

/// Lowercases and keeps `[a-z0-9_-]`.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Name for an imported config: the custom name, else a non-generic file
/// stem, else the endpoint host.
///
/// # Errors
///
/// [`PhantomError::VpnConfig`] if nothing usable remains.
pub fn derive_name(
    custom: Option<&str>,
    source: &Path,
    config: &InterfaceConfig,
) -> Result<String> {
    let raw = match custom.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => name.to_string(),
        None => {
            let stem = source
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty() && !GENERIC_NAMES.contains(s));
            match stem {
                Some(stem) => stem.to_string(),
                None => config
                    .peers
                    .iter()
                    .find_map(|p| p.endpoint.as_ref())
                    .map(|e| e.host().replace(['.', '-'], "_"))
                    .ok_or_else(|| {
                        PhantomError::VpnConfig(
                            "Could not determine config name - please provide custom_name"
                                .to_string(),
                        )
                    })?,
            }
        }
    };
    let name = sanitize_name(&raw);
    if name.is_empty() {
        return Err(PhantomError::VpnConfig("Invalid config name".to_string()));
    }
    Ok(name)
}

/// Checks the keys a multihop exit needs. Returns warnings.
///
/// # Errors
///
/// [`PhantomError::VpnConfig`] naming the first missing item.
pub fn check_exit_config(config: &InterfaceConfig) -> Result<Vec<String>> {
    let invalid = |what: &str| PhantomError::VpnConfig(format!("Invalid VPN configuration: {what}"));
    if config.ipv4_address().is_none() {
        return Err(invalid("Missing required Interface key: Address"));
    }
    let Some(peer) = config.peers.first() else {
        return Err(invalid("Missing required section: [Peer]"));
    };
    if peer.allowed_ips.is_empty() {
        return Err(invalid("Missing required Peer key: AllowedIPs"));
    }
    if peer.endpoint.is_none() {
        return Err(invalid("Missing required Peer key: Endpoint"));
    }
    let mut warnings = Vec::new();
    if !peer.routes_all_ipv4() {
        warn!("{ROUTE_ALL_WARNING}");
        warnings.push(ROUTE_ALL_WARNING.to_string());
    }
    Ok(warnings)
}

/// The `exit_configs/` directory.
#[derive(Debug, Clone)]
pub struct ExitStore {
    dir: PathBuf,
}

impl ExitStore {
    /// Store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Enhanced config path.
    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.conf"))
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.conf.backup"))
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Returns true if an exit with this name is stored.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        sanitize_name(name) == name && self.config_path(name).is_file()
    }

    /// Parsed enhanced config.
    ///
    /// # Errors
    ///
    /// [`PhantomError::ExitNode`] if absent, [`PhantomError::VpnConfig`] if
    /// unparsable.
    pub fn load(&self, name: &str) -> Result<InterfaceConfig> {
        if !self.exists(name) {
            return Err(PhantomError::ExitNode(format!("VPN config '{name}' not found")));
        }
        let raw = fs::read(&self.config_path(name))?;
        parse_wg_config(&raw)
            .map_err(|e| PhantomError::VpnConfig(format!("Invalid VPN configuration: {e}")))
    }

    /// Metadata, if present and readable.
    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<ExitMetadata> {
        match fs::read_json(&self.metadata_path(name)) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(exit = name, error = %err, "unreadable exit metadata");
                None
            }
        }
    }

    /// Stored exit names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Imports the WireGuard config at `source`.
    ///
    /// # Errors
    ///
    /// - [`PhantomError::MissingParameter`] for an empty path
    /// - [`PhantomError::VpnConfig`] if the file is missing, invalid or the
    ///   name is taken
    pub fn import(
        &self,
        ctx: &Context,
        source: &str,
        custom_name: Option<&str>,
    ) -> Result<ImportResult> {
        if source.trim().is_empty() {
            return Err(PhantomError::MissingParameter("config_path".to_string()));
        }
        let source_path = Path::new(source);
        let raw = fs::read_optional(source_path)?
            .ok_or_else(|| PhantomError::VpnConfig(format!("Config file not found: {source}")))?;
        let mut config = parse_wg_config(&raw)
            .map_err(|e| PhantomError::VpnConfig(format!("Invalid VPN configuration: {e}")))?;
        let warnings = check_exit_config(&config)?;

        let name = derive_name(custom_name, source_path, &config)?;
        if self.config_path(&name).exists() {
            return Err(PhantomError::VpnConfig(format!("Config '{name}' already exists")));
        }

        let optimizations: Vec<String> = config
            .peers
            .iter_mut()
            .map(|peer| enhance_keepalive(peer).to_string())
            .collect();

        let backup = self.backup_path(&name);
        let conf = self.config_path(&name);
        fs::write_atomic(&backup, raw.as_bytes(), PRIVATE_MODE)?;
        fs::write_atomic(&conf, config.render().as_bytes(), PRIVATE_MODE)?;

        let metadata = ExitMetadata {
            name: name.clone(),
            imported_at: ctx.clock().now(),
            original_path: source.to_string(),
            backup_path: backup.display().to_string(),
            config_file: conf.display().to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            optimizations_applied: optimizations.clone(),
            multihop_enhanced: true,
        };
        fs::write_json(&self.metadata_path(&name), &metadata, PRIVATE_MODE)?;
        info!(exit = %name, optimizations = optimizations.len(), "exit imported");

        Ok(ImportResult {
            message: format!("VPN config '{name}' imported and optimized for multihop"),
            config_name: name,
            backup_path: metadata.backup_path.clone(),
            metadata,
            optimizations,
            warnings,
        })
    }

    /// Summary of every stored exit.
    #[must_use]
    pub fn list(&self, active_exit: Option<&str>) -> Vec<ExitInfo> {
        self.names()
            .into_iter()
            .map(|name| {
                let endpoint = self
                    .load(&name)
                    .ok()
                    .and_then(|c| c.peers.into_iter().find_map(|p| p.endpoint))
                    .map_or_else(|| "Unknown".to_string(), |e| e.to_string());
                let meta = self.metadata(&name);
                ExitInfo {
                    active: active_exit == Some(name.as_str()),
                    endpoint,
                    provider: meta
                        .as_ref()
                        .map_or_else(default_provider, |m| m.provider.clone()),
                    imported_at: meta.as_ref().map(|m| m.imported_at),
                    multihop_enhanced: meta.is_some_and(|m| m.multihop_enhanced),
                    name,
                }
            })
            .collect()
    }

    /// Deletes an exit's files.
    ///
    /// # Errors
    ///
    /// [`PhantomError::ExitNode`] if absent.
    pub fn remove(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            return Err(PhantomError::ExitNode(format!(
                "VPN configuration '{name}' not found"
            )));
        }
        for path in [
            self.config_path(name),
            self.metadata_path(name),
            self.backup_path(name),
        ] {
            fs::remove_file(&path)?;
        }
        info!(exit = name, "exit removed");
        Ok(())
    }
}
