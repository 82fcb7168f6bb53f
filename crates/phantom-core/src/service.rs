//! Service supervision and host inspection for the main interface.

use ipnet::Ipv4Net;
use phantom_system::{ExecutorExt, SystemCommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::clients::ONLINE_THRESHOLD_SECS;
use crate::context::Context;
use crate::error::{PhantomError, Result};
use crate::firewall;
use crate::interface::MainInterface;

/// Default `service_logs` line count.
pub const DEFAULT_LOG_LINES: u32 = 50;

/// Largest accepted `service_logs` line count.
pub const MAX_LOG_LINES: u32 = 10_000;

/// systemd view of the unit.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceState {
    /// `is-active` reports active.
    pub running: bool,
    /// Unit name.
    pub service_name: String,
    /// `ActiveEnterTimestamp`.
    pub started_at: Option<String>,
    /// `MainPID`.
    pub pid: Option<u32>,
}

/// Kernel view of the interface.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceState {
    /// `wg show` succeeds.
    pub active: bool,
    /// Interface name.
    pub interface: String,
    /// Server public key.
    pub public_key: Option<String>,
    /// Listening port.
    pub port: Option<u16>,
    /// Live peers.
    pub peers: usize,
    /// Received bytes across peers.
    pub rx_bytes: u64,
    /// Sent bytes across peers.
    pub tx_bytes: u64,
}

/// Configured values.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationState {
    /// Interface name.
    pub interface: String,
    /// Interface file path.
    pub config_file: String,
    /// Listen port.
    pub port: u16,
    /// Client subnet.
    pub network: Ipv4Net,
    /// Resolvers handed to clients.
    pub dns: Vec<String>,
    /// Interface file is present.
    pub config_exists: bool,
}

/// Client counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClientCounts {
    /// Stored clients.
    pub total_configured: usize,
    /// Enabled clients.
    pub enabled_clients: usize,
    /// Disabled clients.
    pub disabled_clients: usize,
    /// Clients with a recent handshake.
    pub active_connections: usize,
}

/// Firewall summary for `server_status`.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallSummary {
    /// `active` or `inactive`.
    pub status: &'static str,
}

/// Host information.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    /// Install root.
    pub install_dir: String,
    /// Config directory.
    pub config_dir: String,
    /// Data directory.
    pub data_dir: String,
    /// Firewall summary.
    pub firewall: FirewallSummary,
    /// The wireguard kernel module is loaded.
    pub wireguard_module: bool,
}

/// Result of `server_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// systemd view.
    pub service: ServiceState,
    /// Kernel view.
    pub interface: InterfaceState,
    /// Configured values.
    pub configuration: ConfigurationState,
    /// Client counters.
    pub clients: ClientCounts,
    /// Host information.
    pub system: SystemState,
}

/// Result of `service_logs`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceLogs {
    /// Journal lines, oldest first.
    pub logs: Vec<String>,
    /// Lines returned.
    pub count: usize,
    /// Unit name.
    pub service: String,
    /// Lines asked for.
    pub lines_requested: u32,
}

/// Result of `restart_service`.
#[derive(Debug, Clone, Serialize)]
pub struct RestartResult {
    /// A restart method succeeded.
    pub restarted: bool,
    /// The unit reports active afterwards.
    pub service_active: bool,
    /// The interface answers `wg show`.
    pub interface_up: bool,
    /// Unit name.
    pub service: String,
    /// Summary.
    pub message: String,
}

/// ufw part of the firewall report.
#[derive(Debug, Clone, Serialize)]
pub struct UfwStatus {
    /// ufw is active.
    pub enabled: bool,
    /// Rules mentioning the WireGuard port.
    pub rules: Vec<String>,
}

/// iptables part of the firewall report.
#[derive(Debug, Clone, Serialize)]
pub struct IptablesStatus {
    /// Any relevant rule exists.
    pub has_rules: bool,
    /// Relevant `nat` rules.
    pub nat_rules: Vec<String>,
    /// Relevant `filter` rules.
    pub filter_rules: Vec<String>,
}

/// NAT part of the firewall report.
#[derive(Debug, Clone, Serialize)]
pub struct NatStatus {
    /// Client traffic is masqueraded.
    pub enabled: bool,
    /// The MASQUERADE rules.
    pub rules: Vec<String>,
}

/// Port part of the firewall report.
#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    /// Configured port.
    pub wireguard_port: u16,
    /// Something listens on it.
    pub listening: bool,
}

/// Result of `get_firewall_status`.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStatus {
    /// `active` or `inactive`.
    pub status: &'static str,
    /// ufw.
    pub ufw: UfwStatus,
    /// iptables.
    pub iptables: IptablesStatus,
    /// NAT.
    pub nat: NatStatus,
    /// Port.
    pub ports: PortStatus,
}

/// Service and host inspection.
#[derive(Clone, Debug)]
pub struct ServiceMonitor {
    ctx: Context,
}

impl ServiceMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Aggregated service, interface, configuration and client state.
    pub async fn server_status(&self) -> Result<ServerStatus> {
        let config = self.ctx.load_config()?;
        let store = self.ctx.open_store(&config)?;
        let iface = MainInterface::new(&self.ctx, config.interface());
        let unit = iface.unit();

        let service = ServiceState {
            running: unit.is_active().await,
            service_name: unit.name().to_string(),
            started_at: unit.property("ActiveEnterTimestamp").await,
            pid: unit
                .property("MainPID")
                .await
                .and_then(|p| p.parse().ok()),
        };

        let active = iface.is_up().await;
        let dump = if active { iface.dump().await.ok() } else { None };
        let file = iface.load().ok();
        let now = self.ctx.clock().unix();
        let active_connections = dump.as_ref().map_or(0, |d| {
            d.peers
                .iter()
                .filter(|p| {
                    p.latest_handshake
                        .is_some_and(|ts| now - ts <= ONLINE_THRESHOLD_SECS)
                })
                .filter(|p| store.clients().iter().any(|c| c.public_key == p.public_key))
                .count()
        });

        let interface = InterfaceState {
            active,
            interface: iface.name().to_string(),
            public_key: dump
                .as_ref()
                .and_then(|d| d.public_key)
                .or_else(|| file.as_ref().map(|f| f.private_key.public_key()))
                .map(|k| k.to_base64()),
            port: dump
                .as_ref()
                .and_then(|d| d.listen_port)
                .or_else(|| file.as_ref().and_then(|f| f.listen_port)),
            peers: dump.as_ref().map_or(0, |d| d.peers.len()),
            rx_bytes: dump.as_ref().map_or(0, |d| d.rx_bytes()),
            tx_bytes: dump.as_ref().map_or(0, |d| d.tx_bytes()),
        };

        let enabled = store.clients().iter().filter(|c| c.enabled).count();
        let paths = self.ctx.paths();
        let firewall_on = firewall::ufw_active(self.ctx.executor()).await
            || !self.relevant_filter_rules(config.wireguard.port, config.interface()).await.is_empty();
        let wireguard_module = self
            .ctx
            .executor()
            .stdout(&SystemCommand::new("lsmod"))
            .await
            .is_ok_and(|out| out.lines().any(|l| l.starts_with("wireguard ")));

        Ok(ServerStatus {
            service,
            interface,
            configuration: ConfigurationState {
                interface: config.interface().to_string(),
                config_file: iface.config_path().display().to_string(),
                port: config.wireguard.port,
                network: config.wireguard.network,
                dns: vec![config.dns.primary.to_string(), config.dns.secondary.to_string()],
                config_exists: iface.config_path().exists(),
            },
            clients: ClientCounts {
                total_configured: store.clients().len(),
                enabled_clients: enabled,
                disabled_clients: store.clients().len() - enabled,
                active_connections,
            },
            system: SystemState {
                install_dir: paths.install_dir.display().to_string(),
                config_dir: paths.config_dir().display().to_string(),
                data_dir: paths.data_dir().display().to_string(),
                firewall: FirewallSummary {
                    status: if firewall_on { "active" } else { "inactive" },
                },
                wireguard_module,
            },
        })
    }

    /// Recent journal lines for the unit.
    pub async fn service_logs(&self, lines: u32) -> Result<ServiceLogs> {
        if lines == 0 || lines > MAX_LOG_LINES {
            return Err(PhantomError::validation(format!(
                "lines must be between 1 and {MAX_LOG_LINES}"
            )));
        }
        let config = self.ctx.load_config()?;
        let unit = MainInterface::new(&self.ctx, config.interface()).unit();
        let logs = unit.journal(lines).await?;
        Ok(ServiceLogs {
            count: logs.len(),
            logs,
            service: unit.name().to_string(),
            lines_requested: lines,
        })
    }

    /// Restarts the unit, falling back to `wg-quick down/up`.
    pub async fn restart_service(&self) -> Result<RestartResult> {
        let config = self.ctx.load_config()?;
        let iface = MainInterface::new(&self.ctx, config.interface());
        let unit = iface.unit();

        let restarted = match unit.restart().await {
            Ok(()) => true,
            Err(err) => {
                warn!(unit = %unit.name(), error = %err, "systemctl restart failed, trying wg-quick");
                iface.bounce().await.is_ok()
            }
        };
        if !restarted {
            return Err(PhantomError::ServiceOperation(format!(
                "Failed to restart {}",
                unit.name()
            )));
        }

        let service_active = self
            .ctx
            .settings()
            .timeouts
            .service_start
            .until(self.ctx.cancel(), || unit.is_active())
            .await
            .is_ok();
        let interface_up = iface.is_up().await;
        info!(unit = %unit.name(), service_active, interface_up, "service restarted");

        Ok(RestartResult {
            restarted,
            service_active,
            interface_up,
            service: unit.name().to_string(),
            message: if service_active {
                "WireGuard service restarted successfully".to_string()
            } else {
                "WireGuard service restarted but is not reporting active".to_string()
            },
        })
    }

    /// Filter, NAT and port state relevant to the main interface.
    pub async fn get_firewall_status(&self) -> Result<FirewallStatus> {
        let config = self.ctx.load_config()?;
        let exec = self.ctx.executor();
        let port = config.wireguard.port;
        let iface = config.interface();
        let subnet = config.wireguard.network.to_string();

        let ufw_enabled = firewall::ufw_active(exec).await;
        let port_str = port.to_string();
        let ufw_rules = if ufw_enabled {
            firewall::ufw_rules(exec)
                .await
                .into_iter()
                .filter(|r| r.contains(&port_str))
                .collect()
        } else {
            Vec::new()
        };

        let nat_rules: Vec<String> = firewall::list_rules(exec, "nat", Some("POSTROUTING"))
            .await
            .into_iter()
            .filter(|r| r.contains(&subnet) || r.contains(iface))
            .collect();
        let filter_rules = self.relevant_filter_rules(port, iface).await;
        let masquerade: Vec<String> = nat_rules
            .iter()
            .filter(|r| r.contains("MASQUERADE"))
            .cloned()
            .collect();
        let listening = firewall::udp_listening(exec, port).await;
        let has_rules = !nat_rules.is_empty() || !filter_rules.is_empty();

        Ok(FirewallStatus {
            status: if ufw_enabled || has_rules { "active" } else { "inactive" },
            ufw: UfwStatus {
                enabled: ufw_enabled,
                rules: ufw_rules,
            },
            iptables: IptablesStatus {
                has_rules,
                nat_rules,
                filter_rules,
            },
            nat: NatStatus {
                enabled: !masquerade.is_empty(),
                rules: masquerade,
            },
            ports: PortStatus {
                wireguard_port: port,
                listening,
            },
        })
    }

    async fn relevant_filter_rules(&self, port: u16, iface: &str) -> Vec<String> {
        let port = port.to_string();
        firewall::list_rules(self.ctx.executor(), "filter", None)
            .await
            .into_iter()
            .filter(|r| r.starts_with("-A ") && (r.contains(iface) || r.contains(&port)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientHandler;
    use crate::testing::Sandbox;
    use phantom_system::CommandOutput;

    #[tokio::test]
    async fn status_counts_clients_and_peers() {
        let sandbox = Sandbox::new();
        let handler = ClientHandler::new(sandbox.ctx());
        handler.add_client("alice").await.expect("add");
        handler.add_client("bob").await.expect("add");
        sandbox.exec().on(
            "systemctl show wg-quick@wg_main -p MainPID",
            CommandOutput::ok("4242\n"),
        );
        sandbox
            .exec()
            .on("lsmod", CommandOutput::ok("Module Size Used by\nwireguard 94208 0\n"));

        let status = ServiceMonitor::new(sandbox.ctx())
            .server_status()
            .await
            .expect("status");
        assert!(status.service.running);
        assert_eq!(status.service.service_name, "wg-quick@wg_main");
        assert_eq!(status.service.pid, Some(4242));
        assert!(status.interface.active);
        assert_eq!(status.interface.peers, 2);
        assert_eq!(status.interface.port, Some(51820));
        assert_eq!(status.clients.total_configured, 2);
        assert_eq!(status.clients.active_connections, 0);
        assert!(status.configuration.config_exists);
        assert!(status.system.wireguard_module);
    }

    #[tokio::test]
    async fn logs_use_journalctl() {
        let sandbox = Sandbox::new();
        sandbox.exec().on(
            "journalctl -u wg-quick@wg_main -n 2 --no-pager",
            CommandOutput::ok("a\nb\n"),
        );
        let logs = ServiceMonitor::new(sandbox.ctx())
            .service_logs(2)
            .await
            .expect("logs");
        assert_eq!(logs.count, 2);
        assert_eq!(logs.lines_requested, 2);

        let err = ServiceMonitor::new(sandbox.ctx())
            .service_logs(0)
            .await
            .expect_err("zero");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn restart_falls_back_to_wg_quick() {
        let sandbox = Sandbox::new();
        sandbox
            .exec()
            .on("systemctl restart", CommandOutput::failed(1, "failed"));
        let result = ServiceMonitor::new(sandbox.ctx())
            .restart_service()
            .await
            .expect("restart");
        assert!(result.restarted);
        assert!(result.service_active);
        assert!(sandbox.exec().was_called("wg-quick down wg_main"));
        assert!(sandbox.exec().was_called("wg-quick up wg_main"));
    }

    #[tokio::test]
    async fn restart_fails_when_both_methods_fail() {
        let sandbox = Sandbox::new();
        sandbox
            .exec()
            .on("systemctl restart", CommandOutput::failed(1, "failed"));
        sandbox
            .exec()
            .on("wg-quick up", CommandOutput::failed(1, "RTNETLINK answers"));
        let err = ServiceMonitor::new(sandbox.ctx())
            .restart_service()
            .await
            .expect_err("fails");
        assert_eq!(err.code(), "SERVICE_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn firewall_report_filters_relevant_rules() {
        let sandbox = Sandbox::new();
        sandbox.exec().on(
            "iptables -t nat -S POSTROUTING",
            CommandOutput::ok(
                "-P POSTROUTING ACCEPT\n-A POSTROUTING -s 10.8.0.0/24 -o eth0 -j MASQUERADE\n-A POSTROUTING -s 172.17.0.0/16 -j MASQUERADE\n",
            ),
        );
        sandbox.exec().on(
            "iptables -t filter -S",
            CommandOutput::ok(
                "-P INPUT ACCEPT\n-A INPUT -p udp -m udp --dport 51820 -j ACCEPT\n-A FORWARD -i wg_main -j ACCEPT\n-A INPUT -p tcp --dport 22 -j ACCEPT\n",
            ),
        );
        sandbox.exec().on("ufw status", CommandOutput::ok("Status: inactive\n"));

        let status = ServiceMonitor::new(sandbox.ctx())
            .get_firewall_status()
            .await
            .expect("firewall");
        assert_eq!(status.status, "active");
        assert!(!status.ufw.enabled);
        assert_eq!(status.iptables.nat_rules.len(), 1);
        assert_eq!(status.iptables.filter_rules.len(), 2);
        assert!(status.nat.enabled);
        assert_eq!(status.ports.wireguard_port, 51820);
    }
}
