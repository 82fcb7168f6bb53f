//! Multihop actions: exit import and removal, enable and disable, status,
//! tunnel tests, state reset and the monitor session log.

use ipnet::Ipv4Net;
use phantom_core::config::MultihopState;
use phantom_core::{host_networks, Context, PhantomConfig, PhantomError, Result};
use phantom_system::{ExecutorExt, SystemCommand};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::exits::{sanitize_name, ExitInfo, ExitStore, ImportResult};
use crate::monitor::{self, MonitorStatus};
use crate::routing;
use crate::session::{Entry, SessionLog, DEFAULT_LOG_LINES};
use crate::tunnel::{self, VPN_INTERFACE};

const FLOW_EXIT: &str = "Clients -> Phantom Server -> VPN Exit -> Internet";
const FLOW_DIRECT: &str = "Clients -> Phantom Server -> Internet (direct)";

/// Result of `remove_vpn_config`.
#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    /// Name of the removed exit.
    pub removed: String,
    /// Whether multihop was using it.
    pub was_active: bool,
    /// Summary.
    pub message: String,
}

/// Result of `list_exits`.
#[derive(Debug, Clone, Serialize)]
pub struct ExitList {
    /// Imported exits, by name.
    pub exits: Vec<ExitInfo>,
    /// Whether multihop is on.
    pub multihop_enabled: bool,
    /// Exit in use.
    pub active_exit: Option<String>,
    /// Number of exits.
    pub total: usize,
}

/// Result of `enable_multihop`.
#[derive(Debug, Clone, Serialize)]
pub struct MultihopEnabled {
    /// Exit in use.
    pub exit_name: String,
    /// Always true.
    pub multihop_enabled: bool,
    /// Always true.
    pub handshake_established: bool,
    /// Always true.
    pub connection_verified: bool,
    /// Always true.
    pub monitor_started: bool,
    /// Path client traffic now takes.
    pub traffic_flow: String,
    /// What happens to peer-to-peer traffic.
    pub peer_access: &'static str,
    /// Summary.
    pub message: String,
}

/// Result of `disable_multihop`.
#[derive(Debug, Clone, Serialize)]
pub struct MultihopDisabled {
    /// Always false.
    pub multihop_enabled: bool,
    /// Exit that was in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_exit: Option<String>,
    /// Whether the secondary interface was removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_cleaned: Option<bool>,
    /// Summary.
    pub message: String,
}

/// Liveness of the secondary interface.
#[derive(Debug, Clone, Serialize)]
pub struct VpnInterface {
    /// Whether `wg show` succeeds.
    pub active: bool,
    /// `wg show` output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Why `wg show` failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct MultihopStatus {
    /// Whether multihop is on.
    pub enabled: bool,
    /// Exit in use.
    pub active_exit: Option<String>,
    /// Number of imported exits.
    pub available_configs: usize,
    /// Secondary interface.
    pub vpn_interface: VpnInterface,
    /// Monitor service.
    pub monitor_status: MonitorStatus,
    /// `VPN Exit` or `Direct`.
    pub traffic_routing: &'static str,
    /// Path client traffic takes.
    pub traffic_flow: &'static str,
}

/// Reachability of the exit endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointProbe {
    /// Whether the ping succeeded.
    pub passed: bool,
    /// Host pinged.
    pub host: String,
}

/// Reachability of the tunnel address.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelProbe {
    /// Whether the ping succeeded.
    pub passed: bool,
    /// Address pinged.
    pub vpn_ip: Option<String>,
}

/// Handshake presence.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeProbe {
    /// Whether a handshake is reported.
    pub passed: bool,
    /// Same as `passed`.
    pub has_recent_handshake: bool,
}

/// Probes run by `test_vpn`. The tunnel probes only run for the active
/// exit.
#[derive(Debug, Clone, Serialize)]
pub struct VpnTests {
    /// Ping of the endpoint host.
    pub network_connectivity: EndpointProbe,
    /// Ping of the tunnel address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_interface: Option<TunnelProbe>,
    /// Handshake check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wireguard_handshake: Option<HandshakeProbe>,
}

/// Result of `test_vpn`.
#[derive(Debug, Clone, Serialize)]
pub struct VpnTestReport {
    /// Exit tested.
    pub exit_name: String,
    /// Its endpoint.
    pub endpoint: String,
    /// Individual probes.
    pub tests: VpnTests,
    /// Whether every probe that ran passed.
    pub all_tests_passed: bool,
    /// Summary.
    pub message: &'static str,
}

/// Result of `reset_state`.
#[derive(Debug, Clone, Serialize)]
pub struct ResetResult {
    /// Always true.
    pub reset_complete: bool,
    /// Whether no residue was left.
    pub cleanup_successful: bool,
    /// What was cleaned.
    pub cleaned_up: Vec<&'static str>,
    /// Summary.
    pub message: &'static str,
}

/// Result of `get_session_log`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionLogView {
    /// Whether multihop is on.
    pub active_session: bool,
    /// Whether the log file exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_exists: Option<bool>,
    /// Exit in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_exit: Option<String>,
    /// Monitor service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_status: Option<MonitorStatus>,
    /// Parsed entries, oldest first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_lines: Option<Vec<Entry>>,
    /// Entries in the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<usize>,
    /// Entries returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayed_lines: Option<usize>,
    /// Set when there is nothing to show.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

/// Handler for the `multihop` module.
#[derive(Debug, Clone)]
pub struct MultihopModule {
    ctx: Context,
    exits: ExitStore,
}

impl MultihopModule {
    /// Creates the handler.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        let exits = ExitStore::new(ctx.paths().exit_configs_dir());
        Self { ctx, exits }
    }

    fn session_log(&self) -> SessionLog {
        SessionLog::new(self.ctx.paths().session_log())
    }

    fn exit_name(raw: &str) -> Result<String> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(PhantomError::MissingParameter("exit_name".to_string()));
        }
        if sanitize_name(name) != name {
            return Err(PhantomError::validation(format!("Invalid exit name: {name}")));
        }
        Ok(name.to_string())
    }

    fn persist(&self, active_exit: Option<&str>) -> Result<()> {
        let mut config = self.ctx.load_config()?;
        config.multihop = MultihopState {
            enabled: active_exit.is_some(),
            active_exit: active_exit.map(str::to_string),
            vpn_interface_name: active_exit.map(|_| VPN_INTERFACE.to_string()),
            updated_at: Some(self.ctx.clock().now()),
        };
        self.ctx.save_config(&config)
    }

    /// Subnet on the main interface, falling back to `phantom.json`.
    async fn detect_subnet(&self, config: &PhantomConfig) -> Ipv4Net {
        let main = config.interface();
        let cmd = SystemCommand::new("ip").args(["-4", "-o", "addr", "show", main]);
        let live = match self.ctx.executor().stdout(&cmd).await {
            Ok(out) => host_networks(&out)
                .into_iter()
                .find(|(iface, _)| iface == main)
                .map(|(_, net)| net),
            Err(_) => None,
        };
        live.unwrap_or_else(|| {
            warn!(interface = main, "subnet not found on interface, using configured value");
            config.wireguard.network
        })
    }

    /// Removes the interface, live rules and forwarding. Returns whether
    /// the interface existed.
    async fn cleanup(&self, main: &str, subnet: Ipv4Net) -> bool {
        let exec = self.ctx.executor();
        let existed = tunnel::tear_down(&self.ctx).await;
        let rules = routing::remove_rules(exec, subnet).await;
        let forwarding = routing::remove_forwarding(exec, main, subnet).await;
        info!(rules, forwarding, "multihop routing cleaned");
        existed
    }

    fn checkpoint(&self) -> Result<()> {
        if self.ctx.cancel().is_cancelled() {
            return Err(PhantomError::multihop("Multihop enable cancelled"));
        }
        Ok(())
    }

    /// Imports an exit config from `config_path`.
    ///
    /// # Errors
    ///
    /// See [`ExitStore::import`].
    pub fn import_vpn_config(
        &self,
        config_path: &str,
        custom_name: Option<&str>,
    ) -> Result<ImportResult> {
        self.exits.import(&self.ctx, config_path, custom_name)
    }

    /// Imported exits.
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` is unreadable.
    pub fn list_exits(&self) -> Result<ExitList> {
        let state = self.ctx.load_config()?.multihop;
        let active = state.active_exit.as_deref().filter(|_| state.enabled);
        let exits = self.exits.list(active);
        Ok(ExitList {
            total: exits.len(),
            exits,
            multihop_enabled: state.enabled,
            active_exit: state.active_exit.clone(),
        })
    }

    /// Deletes an exit, switching multihop off first if it is in use.
    ///
    /// # Errors
    ///
    /// [`PhantomError::ExitNode`] if the exit does not exist.
    pub async fn remove_vpn_config(&self, exit_name: &str) -> Result<RemoveResult> {
        let name = Self::exit_name(exit_name)?;
        if !self.exits.exists(&name) {
            return Err(PhantomError::ExitNode(format!(
                "VPN configuration '{name}' not found"
            )));
        }
        let state = self.ctx.load_config()?.multihop;
        let was_active = state.enabled && state.active_exit.as_deref() == Some(name.as_str());
        if was_active {
            info!(exit = %name, "exit in use, disabling multihop first");
            self.disable_multihop().await?;
        }
        self.exits.remove(&name)?;
        Ok(RemoveResult {
            message: format!("VPN configuration '{name}' removed"),
            removed: name,
            was_active,
        })
    }

    /// Routes client traffic through `exit_name`.
    ///
    /// Every step after the initial cleanup is undone if a later one fails
    /// or the context is cancelled; the persisted state only flips to
    /// enabled once the exit has answered.
    ///
    /// # Errors
    ///
    /// - [`PhantomError::MissingParameter`] without a name
    /// - [`PhantomError::ExitNode`] if the exit does not exist
    /// - [`PhantomError::Multihop`] if setup fails, after rollback
    pub async fn enable_multihop(&self, exit_name: &str) -> Result<MultihopEnabled> {
        let name = Self::exit_name(exit_name)?;
        if !self.exits.exists(&name) {
            return Err(PhantomError::ExitNode(format!("VPN config '{name}' not found")));
        }
        let exit = self.exits.load(&name)?;
        let endpoint = exit
            .peers
            .iter()
            .find_map(|p| p.endpoint.as_ref())
            .map_or_else(|| "Unknown".to_string(), ToString::to_string);

        let config = self.ctx.load_config()?;
        let main = config.interface().to_string();
        monitor::stop(&self.ctx).await;
        self.cleanup(&main, config.wireguard.network).await;
        let subnet = self.detect_subnet(&config).await;
        info!(exit = %name, %subnet, "enabling multihop");

        let outcome = match self.setup(&name, &exit, &main, subnet).await {
            Ok(()) => self.persist(Some(&name)),
            Err(err) => Err(err),
        };
        let outcome = match outcome {
            Ok(()) => monitor::start(&self.ctx).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            error!(exit = %name, error = %err, "multihop setup failed, rolling back");
            self.rollback(&main, subnet).await;
            return Err(err);
        }

        info!(exit = %name, "multihop active");
        Ok(MultihopEnabled {
            traffic_flow: format!("Clients → Phantom → VPN Exit ({endpoint})"),
            peer_access: "Peers can still connect directly",
            message: format!("Multihop enabled successfully through {name}"),
            exit_name: name,
            multihop_enabled: true,
            handshake_established: true,
            connection_verified: true,
            monitor_started: true,
        })
    }

    async fn setup(
        &self,
        name: &str,
        exit: &phantom_wireguard::InterfaceConfig,
        main: &str,
        subnet: Ipv4Net,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let exec = ctx.executor();

        tunnel::bring_up(ctx, exit).await?;
        self.checkpoint()?;

        routing::install_policy(ctx, subnet).await?;
        routing::apply_rules(exec, subnet).await?;
        if !tunnel::link_exists(exec).await {
            return Err(PhantomError::multihop(format!(
                "VPN interface {VPN_INTERFACE} is not active"
            )));
        }
        routing::apply_forwarding(exec, main, subnet).await?;
        self.checkpoint()?;

        self.session_log().start(name, ctx.clock().now())?;
        tunnel::wait_for_handshake(ctx).await?;

        if !tunnel::has_handshake(exec).await {
            return Err(PhantomError::Multihop {
                message: "VPN connection test failed".to_string(),
                details: Some(json!({
                    "possible_issues": [
                        "VPN server may be unreachable",
                        "Firewall may be blocking the connection",
                        "VPN credentials may be invalid",
                    ],
                })),
            });
        }
        Ok(())
    }

    async fn rollback(&self, main: &str, subnet: Ipv4Net) {
        monitor::stop(&self.ctx).await;
        routing::remove_policy(&self.ctx).await;
        self.cleanup(main, subnet).await;
        let left = routing::force_clean(self.ctx.executor(), main, subnet).await;
        if !left.is_empty() {
            warn!(residue = ?left, "rollback left multihop state behind");
        }
        if let Err(err) = self.session_log().truncate() {
            warn!(error = %err, "could not clear session log");
        }
        if let Err(err) = self.persist(None) {
            warn!(error = %err, "could not persist multihop state");
        }
        info!("multihop rollback finished");
    }

    /// Routes client traffic directly again.
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` cannot be read or written.
    pub async fn disable_multihop(&self) -> Result<MultihopDisabled> {
        let config = self.ctx.load_config()?;
        if !config.multihop.enabled {
            return Ok(MultihopDisabled {
                multihop_enabled: false,
                previous_exit: None,
                interface_cleaned: None,
                message: "Multihop is not currently enabled".to_string(),
            });
        }
        let previous = config.multihop.active_exit.clone();
        let main = config.interface().to_string();
        let subnet = self.detect_subnet(&config).await;
        info!(exit = ?previous, "disabling multihop");

        monitor::stop(&self.ctx).await;
        if let Err(err) = self.session_log().truncate() {
            warn!(error = %err, "could not clear session log");
        }
        routing::remove_policy(&self.ctx).await;
        let interface_cleaned = self.cleanup(&main, subnet).await;
        self.persist(None)?;

        let left = routing::force_clean(self.ctx.executor(), &main, subnet).await;
        if !left.is_empty() {
            warn!(residue = ?left, "multihop residue survived cleanup");
        }
        Ok(MultihopDisabled {
            multihop_enabled: false,
            previous_exit: previous,
            interface_cleaned: Some(interface_cleaned),
            message: "Multihop routing disabled - client traffic now routes directly through server"
                .to_string(),
        })
    }

    /// Current routing mode.
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` is unreadable.
    pub async fn status(&self) -> Result<MultihopStatus> {
        let state = self.ctx.load_config()?.multihop;
        let vpn_interface = match tunnel::show(self.ctx.executor()).await {
            Ok(output) => VpnInterface {
                active: true,
                output: Some(output),
                error: None,
            },
            Err(error) => VpnInterface {
                active: false,
                output: None,
                error: Some(error),
            },
        };
        Ok(MultihopStatus {
            enabled: state.enabled,
            active_exit: state.active_exit.filter(|_| state.enabled),
            available_configs: self.exits.names().len(),
            vpn_interface,
            monitor_status: monitor::status(&self.ctx).await,
            traffic_routing: if state.enabled { "VPN Exit" } else { "Direct" },
            traffic_flow: if state.enabled { FLOW_EXIT } else { FLOW_DIRECT },
        })
    }

    /// Probes an exit, the active one by default.
    ///
    /// # Errors
    ///
    /// - [`PhantomError::Validation`] without a name and no active exit
    /// - [`PhantomError::ExitNode`] if the exit does not exist
    pub async fn test_vpn(&self, exit_name: Option<&str>) -> Result<VpnTestReport> {
        let state = self.ctx.load_config()?.multihop;
        let active = state.active_exit.clone().filter(|_| state.enabled);
        let name = match exit_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => Self::exit_name(name)?,
            None => active.clone().ok_or_else(|| {
                PhantomError::validation("No active VPN to test - specify exit_name")
            })?,
        };
        let exit = self.exits.load(&name)?;
        let endpoint = exit
            .peers
            .iter()
            .find_map(|p| p.endpoint.clone())
            .ok_or_else(|| PhantomError::VpnConfig("No endpoint found in config".to_string()))?;

        let exec = self.ctx.executor();
        let host = endpoint.host().to_string();
        let ping = SystemCommand::new("ping").args(["-c", "3", "-W", "5", host.as_str()]);
        let network_connectivity = EndpointProbe {
            passed: exec.succeeds(&ping).await,
            host,
        };

        let (vpn_interface, wireguard_handshake) = if active.as_deref() == Some(name.as_str()) {
            let vpn_ip = exit.ipv4_address().map(|a| a.addr().to_string());
            let passed = match &vpn_ip {
                Some(ip) => {
                    let ping = SystemCommand::new("ping").args(["-c", "1", "-W", "2", ip.as_str()]);
                    exec.succeeds(&ping).await
                }
                None => false,
            };
            let handshake = tunnel::has_handshake(exec).await;
            (
                Some(TunnelProbe { passed, vpn_ip }),
                Some(HandshakeProbe {
                    passed: handshake,
                    has_recent_handshake: handshake,
                }),
            )
        } else {
            (None, None)
        };

        let all_tests_passed = network_connectivity.passed
            && vpn_interface.as_ref().is_none_or(|p| p.passed)
            && wireguard_handshake.as_ref().is_none_or(|p| p.passed);
        Ok(VpnTestReport {
            exit_name: name,
            endpoint: endpoint.to_string(),
            tests: VpnTests {
                network_connectivity,
                vpn_interface,
                wireguard_handshake,
            },
            all_tests_passed,
            message: if all_tests_passed {
                "All tests passed"
            } else {
                "Some tests failed"
            },
        })
    }

    /// Tears down every trace of multihop regardless of the recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` cannot be read or written.
    pub async fn reset_state(&self) -> Result<ResetResult> {
        let config = self.ctx.load_config()?;
        let main = config.interface().to_string();
        let detected = self.detect_subnet(&config).await;
        warn!("resetting multihop state");

        monitor::stop(&self.ctx).await;
        if let Err(err) = self.session_log().truncate() {
            warn!(error = %err, "could not clear session log");
        }
        routing::remove_policy(&self.ctx).await;
        self.cleanup(&main, detected).await;
        let exec = self.ctx.executor();
        let mut left = routing::force_clean(exec, &main, detected).await;
        if config.wireguard.network != detected {
            routing::remove_rules(exec, config.wireguard.network).await;
            routing::remove_forwarding(exec, &main, config.wireguard.network).await;
            left.extend(routing::force_clean(exec, &main, config.wireguard.network).await);
        }
        self.persist(None)?;

        Ok(ResetResult {
            reset_complete: true,
            cleanup_successful: left.is_empty(),
            cleaned_up: vec![
                "VPN interfaces (wg_vpn)",
                "Multihop routing rules",
                "Policy routing tables",
                "NAT rules",
                "Multihop configuration state",
                "systemd-networkd routing policies",
            ],
            message: "Multihop state reset completed - system returned to default direct routing",
        })
    }

    /// Last `lines` monitor entries (50 by default).
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` or the log is unreadable.
    pub async fn get_session_log(&self, lines: Option<usize>) -> Result<SessionLogView> {
        let state = self.ctx.load_config()?.multihop;
        if !state.enabled {
            return Ok(SessionLogView {
                active_session: false,
                message: Some("No active multihop session"),
                ..SessionLogView::default()
            });
        }
        let log = self.session_log();
        if !log.exists() {
            return Ok(SessionLogView {
                active_session: true,
                log_exists: Some(false),
                message: Some("Session log not found"),
                ..SessionLogView::default()
            });
        }
        let (entries, total) = log.tail(lines.unwrap_or(DEFAULT_LOG_LINES))?;
        Ok(SessionLogView {
            active_session: true,
            log_exists: Some(true),
            active_exit: state.active_exit,
            monitor_status: Some(monitor::status(&self.ctx).await),
            total_lines: Some(total),
            displayed_lines: Some(entries.len()),
            log_lines: Some(entries),
            message: None,
        })
    }
}
