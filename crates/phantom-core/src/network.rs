//! Client subnet inspection and migration.
//!
//! A migration is a transaction over four state holders: the interface
//! file, the client store, `phantom.json` and the NAT table. All of them
//! are snapshotted into `backups/subnet_change_<ts>/` first and restored
//! if any later step or the final verification fails.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::{IpNet, Ipv4Net};
use phantom_system::fs::{self, PRIVATE_MODE};
use phantom_system::{ExecutorExt, SystemCommand};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::allocation::{self, required_hosts, server_address, usable_hosts};
use crate::clients::{render_client_config, ONLINE_THRESHOLD_SECS};
use crate::config::PhantomConfig;
use crate::context::Context;
use crate::error::{PhantomError, Result};
use crate::features::GhostState;
use crate::firewall::{self, IptablesRule, Position};
use crate::interface::{host_networks, MainInterface};
use crate::store::DataStore;

/// Longest prefix a client subnet may have.
pub const MAX_PREFIX: u8 = 29;

/// Fewest usable hosts a client subnet must offer.
pub const MIN_USABLE: u32 = 8;

/// Client counts in [`SubnetInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct SubnetClients {
    /// Stored clients.
    pub total: usize,
    /// Clients with a recent handshake.
    pub active: usize,
}

/// Conditions that prevent or complicate a migration.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Blockers {
    /// Ghost mode is enabled.
    pub ghost_mode: bool,
    /// Multihop is enabled.
    pub multihop: bool,
    /// Peers are connected right now.
    pub active_connections: bool,
}

/// Host uplink.
#[derive(Debug, Clone, Serialize)]
pub struct UplinkInfo {
    /// Interface carrying the default route.
    pub interface: Option<String>,
    /// Its first IPv4 address.
    pub ip: Option<Ipv4Addr>,
}

/// Result of `get_subnet_info`.
#[derive(Debug, Clone, Serialize)]
pub struct SubnetInfo {
    /// Subnet in `phantom.json`.
    pub current_subnet: Ipv4Net,
    /// Total addresses.
    pub subnet_size: u64,
    /// Addresses minus network and broadcast.
    pub usable_ips: u32,
    /// Client counts.
    pub clients: SubnetClients,
    /// Client addresses still free.
    pub free_ips: u32,
    /// Server address.
    pub server_ip: Ipv4Addr,
    /// No blocker is set.
    pub can_change: bool,
    /// Blockers.
    pub blockers: Blockers,
    /// Host uplink.
    pub main_interface: UplinkInfo,
    /// Human-readable notes.
    pub warnings: Vec<String>,
}

/// One named check in [`SubnetValidation`].
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    /// The check passed.
    pub valid: bool,
    /// Why it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Check {
    fn pass() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn fail(error: String) -> Self {
        Self {
            valid: false,
            error: Some(error),
        }
    }
}

/// Numbers behind a validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetails {
    /// Usable hosts in the proposed subnet.
    pub usable_ips: u32,
    /// Hosts needed for the current clients plus headroom.
    pub required_ips: u64,
    /// Old to new address, present when the change is valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_mapping_preview: Option<BTreeMap<String, String>>,
}

/// Result of `validate_subnet_change`.
#[derive(Debug, Clone, Serialize)]
pub struct SubnetValidation {
    /// Every check passed.
    pub valid: bool,
    /// Proposed subnet.
    pub new_subnet: Ipv4Net,
    /// Current subnet.
    pub current_subnet: Ipv4Net,
    /// Per-check outcome.
    pub checks: BTreeMap<&'static str, Check>,
    /// Failed check messages, in evaluation order.
    pub errors: Vec<String>,
    /// Notes for the operator.
    pub warnings: Vec<String>,
    /// Numbers.
    pub details: ValidationDetails,
}

/// Result of `change_subnet`.
#[derive(Debug, Clone, Serialize)]
pub struct SubnetChange {
    /// Always true.
    pub success: bool,
    /// Subnet before.
    pub old_subnet: Ipv4Net,
    /// Subnet after.
    pub new_subnet: Ipv4Net,
    /// Server address after.
    pub server_ip: Ipv4Addr,
    /// Clients readdressed.
    pub clients_updated: usize,
    /// Snapshot directory name; absent for a no-op.
    pub backup_id: Option<String>,
    /// Old to new address, server included.
    pub ip_mapping: BTreeMap<String, String>,
}

/// Parses a CIDR subnet. Host bits must be zero.
///
/// # Errors
///
/// [`PhantomError::Validation`] when malformed.
pub fn parse_subnet(value: &str) -> Result<Ipv4Net> {
    let value = value.trim();
    let net: Ipv4Net = value.parse().map_err(|_| {
        PhantomError::validation(format!(
            "Invalid subnet format for '{value}'. Use CIDR notation such as '10.8.0.0/24'"
        ))
    })?;
    if net.trunc() != net {
        return Err(PhantomError::validation(format!(
            "Invalid subnet '{value}': host bits are set, did you mean {}?",
            net.trunc()
        )));
    }
    Ok(net)
}

/// Byte-level copy of every file a migration touches.
struct Snapshot {
    id: String,
    dir: PathBuf,
    old_subnet: Ipv4Net,
    uplink: String,
    files: Vec<(PathBuf, Option<Vec<u8>>)>,
}

/// Subnet inspection and migration.
#[derive(Clone, Debug)]
pub struct NetworkMigrator {
    ctx: Context,
}

impl NetworkMigrator {
    /// Creates a migrator.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    fn blockers_for(&self, config: &PhantomConfig, active: usize) -> Blockers {
        Blockers {
            ghost_mode: GhostState::is_enabled(&self.ctx.paths().ghost_state()),
            multihop: config.multihop.enabled,
            active_connections: active > 0,
        }
    }

    async fn active_connections(&self, config: &PhantomConfig, store: &DataStore) -> usize {
        let Ok(dump) = MainInterface::new(&self.ctx, config.interface()).dump().await else {
            return 0;
        };
        let now = self.ctx.clock().unix();
        dump.peers
            .iter()
            .filter(|p| p.latest_handshake.is_some_and(|ts| now - ts <= ONLINE_THRESHOLD_SECS))
            .filter(|p| store.clients().iter().any(|c| c.public_key == p.public_key))
            .count()
    }

    async fn uplink(&self) -> UplinkInfo {
        let interface = firewall::default_route_interface(self.ctx.executor()).await;
        let ip = match &interface {
            Some(name) => MainInterface::new(&self.ctx, name.clone())
                .ipv4_addresses()
                .await
                .into_iter()
                .next(),
            None => None,
        };
        UplinkInfo { interface, ip }
    }

    /// Current subnet, usage and blockers.
    pub async fn get_subnet_info(&self) -> Result<SubnetInfo> {
        let config = self.ctx.load_config()?;
        let store = self.ctx.open_store(&config)?;
        let subnet = config.wireguard.network;
        let active = self.active_connections(&config, &store).await;
        let blockers = self.blockers_for(&config, active);

        let mut warnings = Vec::new();
        if blockers.ghost_mode {
            warnings.push("Ghost Mode is active".to_string());
        }
        if blockers.multihop {
            warnings.push("Multihop is active".to_string());
        }
        if blockers.active_connections {
            warnings.push(format!("{active} active connections"));
        }

        let total = store.clients().len();
        let capacity = allocation::client_capacity(subnet);
        Ok(SubnetInfo {
            current_subnet: subnet,
            subnet_size: 1u64 << (32 - u32::from(subnet.prefix_len())),
            usable_ips: usable_hosts(subnet),
            clients: SubnetClients { total, active },
            free_ips: capacity.saturating_sub(u32::try_from(total).unwrap_or(u32::MAX)),
            server_ip: server_address(subnet),
            can_change: !(blockers.ghost_mode || blockers.multihop || blockers.active_connections),
            blockers,
            main_interface: self.uplink().await,
            warnings,
        })
    }

    /// Runs every check against `new_subnet` without changing anything.
    ///
    /// # Errors
    ///
    /// [`PhantomError::Validation`] only when `new_subnet` does not parse;
    /// failed checks are reported in the result.
    pub async fn validate_subnet_change(&self, new_subnet: &str) -> Result<SubnetValidation> {
        let new = parse_subnet(new_subnet)?;
        let config = self.ctx.load_config()?;
        let store = self.ctx.open_store(&config)?;
        let current = config.wireguard.network;
        let active = self.active_connections(&config, &store).await;
        let blockers = self.blockers_for(&config, active);

        let usable = usable_hosts(new);
        let clients = store.clients().len();
        let required = required_hosts(clients);
        let mut checks = BTreeMap::new();

        checks.insert(
            "subnet_size",
            if new.prefix_len() > MAX_PREFIX {
                Check::fail(format!(
                    "Subnet too small. Minimum /{MAX_PREFIX} required (8 addresses), got /{}",
                    new.prefix_len()
                ))
            } else if usable < MIN_USABLE {
                Check::fail(format!(
                    "Subnet must have at least {MIN_USABLE} usable IPs, got {usable}"
                ))
            } else {
                Check::pass()
            },
        );

        checks.insert(
            "private_subnet",
            if allocation::is_rfc1918(new) {
                Check::pass()
            } else {
                Check::fail(format!(
                    "Subnet {new} is not within RFC1918 private ranges (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16)"
                ))
            },
        );

        let conflicts = self.conflicts(config.interface(), new).await;
        checks.insert(
            "network_conflicts",
            if conflicts.is_empty() {
                Check::pass()
            } else {
                Check::fail(format!(
                    "Network conflicts detected with: {}",
                    conflicts.join(", ")
                ))
            },
        );

        checks.insert(
            "capacity",
            if u64::from(usable) >= required {
                Check::pass()
            } else {
                Check::fail(format!(
                    "Insufficient capacity. Need {required} IPs ({clients} clients + 20% buffer), but subnet has {usable}"
                ))
            },
        );

        let mut blocker_errors = Vec::new();
        if blockers.ghost_mode {
            blocker_errors.push("Ghost Mode is active. Disable it before changing subnet.".to_string());
        }
        if blockers.multihop {
            blocker_errors.push("Multihop is active. Disable it before changing subnet.".to_string());
        }
        checks.insert(
            "blockers",
            if blocker_errors.is_empty() {
                Check::pass()
            } else {
                Check::fail(blocker_errors.join(" "))
            },
        );

        let mut errors: Vec<String> = ["subnet_size", "private_subnet", "network_conflicts", "capacity"]
            .iter()
            .filter_map(|name| checks.get(name).and_then(|c| c.error.clone()))
            .collect();
        errors.extend(blocker_errors);
        let valid = errors.is_empty();

        let mut warnings = Vec::new();
        if active > 0 {
            warnings.push(format!(
                "There are {active} active connections that will be disconnected."
            ));
        }
        if new.prefix_len() > current.prefix_len() {
            warnings.push(
                "New subnet is smaller than current subnet. Ensure all clients can be accommodated."
                    .to_string(),
            );
        }
        warnings.extend(change_warnings(clients));

        let ip_mapping_preview = if valid {
            address_plan(&store, current, new).map(|plan| render_plan(&plan))
        } else {
            None
        };

        Ok(SubnetValidation {
            valid,
            new_subnet: new,
            current_subnet: current,
            checks,
            errors,
            warnings,
            details: ValidationDetails {
                usable_ips: usable,
                required_ips: required,
                ip_mapping_preview,
            },
        })
    }

    /// `interface: network` for every host address overlapping `subnet`,
    /// the main interface excluded.
    async fn conflicts(&self, main: &str, subnet: Ipv4Net) -> Vec<String> {
        let cmd = SystemCommand::new("ip").args(["-4", "-o", "addr", "show"]);
        let Ok(out) = self.ctx.executor().stdout(&cmd).await else {
            warn!("could not list host addresses, skipping conflict check");
            return Vec::new();
        };
        host_networks(&out)
            .into_iter()
            .filter(|(name, net)| name != main && allocation::overlaps(*net, subnet))
            .map(|(name, net)| format!("{name}: {net}"))
            .collect()
    }

    /// Moves the server and every client to `new_subnet`.
    pub async fn change_subnet(&self, new_subnet: &str, confirm: bool) -> Result<SubnetChange> {
        if !confirm {
            return Err(PhantomError::validation(
                "Subnet change requires explicit confirmation. Review validate_subnet_change and pass confirm=true",
            ));
        }
        let new = parse_subnet(new_subnet)?;
        let config = self.ctx.load_config()?;
        let old = config.wireguard.network;
        if new == old {
            info!(subnet = %new, "subnet unchanged");
            return Ok(SubnetChange {
                success: true,
                old_subnet: old,
                new_subnet: new,
                server_ip: server_address(new),
                clients_updated: 0,
                backup_id: None,
                ip_mapping: BTreeMap::new(),
            });
        }

        let validation = self.validate_subnet_change(new_subnet).await?;
        if !validation.valid {
            return Err(PhantomError::validation_with(
                format!(
                    "Subnet change cannot proceed: {}",
                    validation.errors.join("; ")
                ),
                json!({ "errors": validation.errors }),
            ));
        }

        let snapshot = self.snapshot(&config).await?;
        info!(from = %old, to = %new, backup = %snapshot.id, "subnet migration started");

        match self.migrate(&config, &snapshot, new).await {
            Ok(change) => {
                info!(
                    from = %old,
                    to = %new,
                    clients = change.clients_updated,
                    "subnet migration complete"
                );
                Ok(change)
            }
            Err(err) => {
                error!(error = %err, backup = %snapshot.id, "subnet migration failed, rolling back");
                match self.rollback(&config, &snapshot, new).await {
                    Ok(()) => Err(PhantomError::Network {
                        message: format!("Subnet change failed and was rolled back: {err}"),
                        details: Some(json!({ "rolled_back": true, "backup_id": snapshot.id })),
                    }),
                    Err(rollback_err) => Err(PhantomError::Network {
                        message: format!(
                            "Subnet change failed and rollback also failed: {err}; {rollback_err}. Manual restore from backup {} required",
                            snapshot.id
                        ),
                        details: Some(json!({
                            "rolled_back": false,
                            "backup_id": snapshot.id,
                            "backup_path": snapshot.dir.display().to_string(),
                        })),
                    }),
                }
            }
        }
    }

    async fn snapshot(&self, config: &PhantomConfig) -> Result<Snapshot> {
        let paths = self.ctx.paths();
        let id = format!("subnet_change_{}", self.ctx.clock().unix());
        let dir = paths.backups_dir().join(&id);
        let uplink = firewall::default_route_interface(self.ctx.executor())
            .await
            .ok_or_else(|| {
                PhantomError::network("Could not determine the default route interface")
            })?;

        let mut watched = vec![
            paths.wg_config(config.interface()),
            paths.clients_db(),
            paths.phantom_json(),
        ];
        let store = self.ctx.open_store(config)?;
        watched.extend(
            store
                .clients()
                .iter()
                .map(|c| paths.client_config(&c.name)),
        );

        let mut files = Vec::with_capacity(watched.len());
        for path in watched {
            let bytes = std::fs::read(&path).ok();
            files.push((path, bytes));
        }

        let nat = self
            .ctx
            .executor()
            .stdout(&SystemCommand::new("iptables-save").args(["-t", "nat"]))
            .await
            .unwrap_or_default();

        let write = || -> Result<()> {
            fs::create_dir_all(&dir)?;
            for (path, bytes) in &files {
                if let (Some(bytes), Some(name)) = (bytes, path.file_name()) {
                    fs::write_atomic(&dir.join(name), bytes, PRIVATE_MODE)?;
                }
            }
            fs::write_atomic(&dir.join("nat_rules.txt"), nat.as_bytes(), PRIVATE_MODE)?;
            let metadata = json!({
                "id": id,
                "timestamp": self.ctx.clock().now(),
                "original_subnet": config.wireguard.network,
                "uplink": uplink,
                "files": files.iter().map(|(p, b)| json!({
                    "path": p.display().to_string(),
                    "existed": b.is_some(),
                })).collect::<Vec<_>>(),
            });
            fs::write_json(&dir.join("backup_metadata.json"), &metadata, PRIVATE_MODE)?;
            Ok(())
        };
        if let Err(err) = write() {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %cleanup, "partial backup left behind");
            }
            return Err(PhantomError::ServiceOperation(format!(
                "Unable to create backup before subnet change: {err}"
            )));
        }

        Ok(Snapshot {
            id,
            dir,
            old_subnet: config.wireguard.network,
            uplink,
            files,
        })
    }

    async fn migrate(
        &self,
        config: &PhantomConfig,
        snapshot: &Snapshot,
        new: Ipv4Net,
    ) -> Result<SubnetChange> {
        let old = snapshot.old_subnet;
        let mut store = self.ctx.open_store(config)?;
        let plan = address_plan(&store, old, new).ok_or_else(|| {
            PhantomError::IpAllocation(format!("No available IP addresses in {new}"))
        })?;

        let by_name: BTreeMap<String, Ipv4Addr> = plan
            .clients
            .iter()
            .map(|(name, _, ip)| (name.clone(), *ip))
            .collect();
        store.readdress(new, &by_name)?;
        store.save()?;

        let iface = MainInterface::new(&self.ctx, config.interface());
        let mut wg = iface.load()?;
        let by_ip: HashMap<Ipv4Addr, Ipv4Addr> = plan
            .clients
            .iter()
            .map(|(_, from, to)| (*from, *to))
            .collect();
        let server_net = Ipv4Net::new(plan.server.1, new.prefix_len())
            .map_err(|err| PhantomError::Internal(err.to_string()))?;
        for address in &mut wg.addresses {
            if matches!(address, IpNet::V4(a) if old.contains(&a.addr())) {
                *address = IpNet::V4(server_net);
            }
        }
        for peer in &mut wg.peers {
            for allowed in &mut peer.allowed_ips {
                if let IpNet::V4(net) = allowed {
                    if let Some(to) = by_ip.get(&net.addr()) {
                        *allowed = IpNet::V4(Ipv4Net::from(*to));
                    }
                }
            }
        }
        let (from, to) = (old.to_string(), new.to_string());
        for hook in wg.post_up.iter_mut().chain(wg.post_down.iter_mut()) {
            *hook = hook.replace(&from, &to);
        }
        iface.save(&wg)?;

        let exec = self.ctx.executor();
        IptablesRule::masquerade(old, &snapshot.uplink).remove(exec).await;
        IptablesRule::masquerade(new, &snapshot.uplink)
            .ensure(exec, Position::Append)
            .await?;

        let mut updated = config.clone();
        updated.wireguard.network = new;
        let server_key = wg.private_key.public_key();
        for record in store.clients() {
            let path = self.ctx.paths().client_config(&record.name);
            if path.exists() {
                let rendered = render_client_config(&updated, server_key.clone(), record);
                fs::write_atomic(&path, rendered.as_bytes(), PRIVATE_MODE)?;
            }
        }
        self.ctx.save_config(&updated)?;

        self.cycle(&iface).await?;
        self.verify(&iface, plan.server.1).await?;

        Ok(SubnetChange {
            success: true,
            old_subnet: old,
            new_subnet: new,
            server_ip: plan.server.1,
            clients_updated: plan.clients.len(),
            backup_id: Some(snapshot.id.clone()),
            ip_mapping: render_plan(&plan),
        })
    }

    /// Stop, drop the link, start. A failed start is retried once.
    async fn cycle(&self, iface: &MainInterface<'_>) -> Result<()> {
        let unit = iface.unit();
        unit.stop().await?;
        tokio::time::sleep(self.ctx.settings().timeouts.settle).await;
        if let Err(err) = iface.delete_link().await {
            debug!(error = %err, "no link to drop after stop");
        }
        if let Err(err) = unit.start().await {
            warn!(error = %err, "start failed, retrying after link cleanup");
            if let Err(err) = iface.delete_link().await {
                debug!(error = %err, "no link to drop before retry");
            }
            tokio::time::sleep(self.ctx.settings().timeouts.settle).await;
            unit.start().await?;
        }
        Ok(())
    }

    async fn verify(&self, iface: &MainInterface<'_>, server: Ipv4Addr) -> Result<()> {
        let owned = iface.unit();
        let unit = &owned;
        self.ctx
            .settings()
            .timeouts
            .migration_verify
            .until(self.ctx.cancel(), || async move {
                unit.is_active().await && iface.ipv4_addresses().await.contains(&server)
            })
            .await
            .map_err(|err| {
                PhantomError::ServiceOperation(format!(
                    "{} is not serving {server} after the subnet change: {err}",
                    unit.name()
                ))
            })?;
        Ok(())
    }

    async fn rollback(&self, config: &PhantomConfig, snapshot: &Snapshot, new: Ipv4Net) -> Result<()> {
        let iface = MainInterface::new(&self.ctx, config.interface());
        let unit = iface.unit();
        if let Err(err) = unit.stop().await {
            warn!(error = %err, "stop during rollback failed");
        }
        if let Err(err) = iface.delete_link().await {
            debug!(error = %err, "no link to drop during rollback");
        }

        for (path, bytes) in &snapshot.files {
            match bytes {
                Some(bytes) => fs::write_atomic(path, bytes, PRIVATE_MODE)?,
                None => {
                    fs::remove_file(path)?;
                }
            }
        }

        let exec = self.ctx.executor();
        IptablesRule::masquerade(new, &snapshot.uplink).remove(exec).await;
        IptablesRule::masquerade(snapshot.old_subnet, &snapshot.uplink)
            .ensure(exec, Position::Append)
            .await?;

        self.cycle(&iface).await?;
        info!(backup = %snapshot.id, "subnet migration rolled back");
        Ok(())
    }
}

/// Server and client moves for one migration.
struct AddressPlan {
    server: (Ipv4Addr, Ipv4Addr),
    clients: Vec<(String, Ipv4Addr, Ipv4Addr)>,
}

fn address_plan(store: &DataStore, old: Ipv4Net, new: Ipv4Net) -> Option<AddressPlan> {
    let current: Vec<(String, Ipv4Addr)> = store
        .clients()
        .iter()
        .map(|c| (c.name.clone(), c.ip))
        .collect();
    Some(AddressPlan {
        server: (server_address(old), server_address(new)),
        clients: allocation::remap(&current, new)?,
    })
}

fn render_plan(plan: &AddressPlan) -> BTreeMap<String, String> {
    std::iter::once((plan.server.0, plan.server.1))
        .chain(plan.clients.iter().map(|(_, from, to)| (*from, *to)))
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

fn change_warnings(clients: usize) -> Vec<String> {
    let mut warnings = Vec::new();
    if clients > 0 {
        warnings.push(format!(
            "All {clients} client configurations will be automatically updated"
        ));
    }
    warnings.push("WireGuard service will be restarted".to_string());
    warnings.push("Firewall rules will be updated".to_string());
    warnings.push("Brief network interruption expected (usually under 10 seconds)".to_string());
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientHandler;
    use crate::testing::Sandbox;
    use phantom_system::CommandOutput;
    use test_case::test_case;

    async fn with_clients(names: &[&str]) -> Sandbox {
        let sandbox = Sandbox::new();
        let handler = ClientHandler::new(sandbox.ctx());
        for name in names {
            handler.add_client(name).await.expect("add");
        }
        sandbox
    }

    #[test_case("10.8.0.0" ; "no prefix")]
    #[test_case("10.8.0.1/24" ; "host bits")]
    #[test_case("fd00::/64" ; "ipv6")]
    #[test_case("banana" ; "garbage")]
    fn parse_rejects(value: &str) {
        assert_eq!(parse_subnet(value).expect_err("invalid").code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn info_reports_usage() {
        let sandbox = with_clients(&["c1", "c2"]).await;
        let info = NetworkMigrator::new(sandbox.ctx())
            .get_subnet_info()
            .await
            .expect("info");
        assert_eq!(info.current_subnet.to_string(), "10.8.0.0/24");
        assert_eq!(info.subnet_size, 256);
        assert_eq!(info.usable_ips, 254);
        assert_eq!(info.clients.total, 2);
        assert_eq!(info.free_ips, 251);
        assert_eq!(info.server_ip, Ipv4Addr::new(10, 8, 0, 1));
        assert!(info.can_change);
        assert_eq!(info.main_interface.interface.as_deref(), Some("eth0"));
    }

    #[test_case("10.9.0.0/30", "subnet_size" ; "too small")]
    #[test_case("100.64.0.0/24", "private_subnet" ; "not private")]
    #[tokio::test]
    async fn validation_flags_check(subnet: &str, check: &str) {
        let sandbox = Sandbox::new();
        let report = NetworkMigrator::new(sandbox.ctx())
            .validate_subnet_change(subnet)
            .await
            .expect("validate");
        assert!(!report.valid);
        assert!(!report.checks[check].valid);
        assert!(report.details.ip_mapping_preview.is_none());
    }

    #[tokio::test]
    async fn validation_detects_host_overlap() {
        let sandbox = Sandbox::new();
        sandbox.exec().on(
            "ip -4 -o addr show",
            CommandOutput::ok(
                "2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0\n5: wg_main    inet 10.8.0.1/24 scope global wg_main\n",
            ),
        );
        let migrator = NetworkMigrator::new(sandbox.ctx());
        let report = migrator
            .validate_subnet_change("192.168.0.0/16")
            .await
            .expect("validate");
        assert!(!report.checks["network_conflicts"].valid);
        assert!(report.errors[0].contains("eth0: 192.168.1.0/24"));

        let own = migrator
            .validate_subnet_change("10.8.0.0/16")
            .await
            .expect("validate");
        assert!(own.checks["network_conflicts"].valid);
    }

    #[tokio::test]
    async fn validation_blocked_by_multihop() {
        let sandbox = Sandbox::new();
        let mut config = sandbox.config();
        config.multihop.enabled = true;
        sandbox.ctx().save_config(&config).expect("save");

        let report = NetworkMigrator::new(sandbox.ctx())
            .validate_subnet_change("10.9.0.0/24")
            .await
            .expect("validate");
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("Multihop is active")));

        let err = NetworkMigrator::new(sandbox.ctx())
            .change_subnet("10.9.0.0/24", true)
            .await
            .expect_err("blocked");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(sandbox.config().wireguard.network.to_string(), "10.8.0.0/24");
    }

    #[tokio::test]
    async fn validation_previews_mapping() {
        let sandbox = with_clients(&["c1", "c2"]).await;
        let report = NetworkMigrator::new(sandbox.ctx())
            .validate_subnet_change("10.9.0.0/24")
            .await
            .expect("validate");
        assert!(report.valid, "{:?}", report.errors);
        let preview = report.details.ip_mapping_preview.expect("preview");
        assert_eq!(preview["10.8.0.1"], "10.9.0.1");
        assert_eq!(preview["10.8.0.3"], "10.9.0.3");
        assert_eq!(report.details.required_ips, 4);
    }

    #[tokio::test]
    async fn change_requires_confirmation() {
        let sandbox = Sandbox::new();
        let err = NetworkMigrator::new(sandbox.ctx())
            .change_subnet("10.9.0.0/24", false)
            .await
            .expect_err("unconfirmed");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn same_subnet_is_noop() {
        let sandbox = Sandbox::new();
        let before = sandbox.snapshot(&sandbox.wg_path());
        let change = NetworkMigrator::new(sandbox.ctx())
            .change_subnet("10.8.0.0/24", true)
            .await
            .expect("noop");
        assert!(change.success);
        assert!(change.backup_id.is_none());
        assert_eq!(sandbox.snapshot(&sandbox.wg_path()), before);
        assert!(!sandbox.exec().was_called("systemctl stop"));
    }

    #[tokio::test]
    async fn migrates_everything() {
        let sandbox = with_clients(&["c1", "c2"]).await;
        let migrator = NetworkMigrator::new(sandbox.ctx());
        let change = migrator
            .change_subnet("10.9.0.0/24", true)
            .await
            .expect("migrate");
        assert_eq!(change.new_subnet.to_string(), "10.9.0.0/24");
        assert_eq!(change.clients_updated, 2);
        assert_eq!(change.ip_mapping["10.8.0.2"], "10.9.0.2");

        let info = migrator.get_subnet_info().await.expect("info");
        assert_eq!(info.current_subnet.to_string(), "10.9.0.0/24");

        let store = sandbox.store();
        assert_eq!(store.client("c1").map(|c| c.ip), Some(Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(store.client("c2").map(|c| c.ip), Some(Ipv4Addr::new(10, 9, 0, 3)));
        assert_eq!(store.subnet().to_string(), "10.9.0.0/24");

        let wg = sandbox.read_wg_config();
        assert_eq!(
            wg.ipv4_address().map(|a| a.to_string()).as_deref(),
            Some("10.9.0.1/24")
        );
        assert!(wg.peers.iter().all(|p| p.allowed_ips[0].to_string().starts_with("10.9.0.")));
        assert!(wg.post_up[0].contains("-s 10.9.0.0/24"));

        assert!(sandbox.has_iptables_rule("-s 10.9.0.0/24 -o eth0 -j MASQUERADE"));
        assert!(!sandbox.has_iptables_rule("-s 10.8.0.0/24"));

        let export = std::fs::read_to_string(sandbox.paths().client_config("c1")).expect("export");
        assert!(export.contains("Address = 10.9.0.2/32"));

        let backup = sandbox
            .paths()
            .backups_dir()
            .join(change.backup_id.expect("backup id"));
        assert!(backup.join("clients.json").exists());
        assert!(backup.join("nat_rules.txt").exists());
    }

    #[tokio::test]
    async fn failed_verification_rolls_back() {
        let sandbox = with_clients(&["c1"]).await;
        sandbox.exec().on(
            "ip -4 -o addr show wg_main",
            CommandOutput::ok("5: wg_main    inet 10.8.0.1/24 scope global wg_main\n"),
        );
        let watched = [
            sandbox.wg_path(),
            sandbox.paths().clients_db(),
            sandbox.paths().phantom_json(),
            sandbox.paths().client_config("c1"),
        ];
        let before: Vec<_> = watched.iter().map(|p| sandbox.snapshot(p)).collect();

        let err = NetworkMigrator::new(sandbox.ctx())
            .change_subnet("10.9.0.0/24", true)
            .await
            .expect_err("rolled back");
        assert_eq!(err.code(), "NETWORK_ERROR");
        let details = err.details().expect("details");
        assert_eq!(details["rolled_back"], true);

        let after: Vec<_> = watched.iter().map(|p| sandbox.snapshot(p)).collect();
        assert_eq!(before, after);
        assert!(sandbox.has_iptables_rule("-s 10.8.0.0/24 -o eth0 -j MASQUERADE"));
        assert!(!sandbox.has_iptables_rule("-s 10.9.0.0/24"));
    }
}
