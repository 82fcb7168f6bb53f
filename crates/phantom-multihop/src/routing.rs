//! Policy routing that sends client traffic out through the exit.
//!
//! Two layers carry the same rules: a systemd-networkd file so they survive
//! reboots and link flaps, and imperative `ip rule`/`ip route` commands so
//! they apply immediately. Peer-to-peer traffic inside the subnet keeps the
//! main table at a higher priority than the exit rule.

use std::fmt::Write as _;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use phantom_core::firewall::{self, IptablesRule, Position};
use phantom_core::systemd::Unit;
use phantom_core::{Context, Result};
use phantom_system::fs::{self, PUBLIC_MODE};
use phantom_system::{Executor, ExecutorExt, SystemCommand};
use tracing::{debug, info, warn};

use crate::tunnel::VPN_INTERFACE;

/// Routing table id for exit traffic.
pub const TABLE_ID: u32 = 100;
/// Routing table name registered in `rt_tables`.
pub const TABLE_NAME: &str = "multihop";
/// Priority of the subnet-to-subnet rule that keeps peer traffic local.
pub const PEER_PRIORITY: u32 = 100;
/// Priority of the rule sending the subnet to the exit table.
pub const EXIT_PRIORITY: u32 = 200;

const NETWORKD: &str = "systemd-networkd";
const MAX_FORCE_PASSES: usize = 3;
const MAX_DUPLICATES: usize = 16;

/// Path of the networkd policy file.
#[must_use]
pub fn policy_path(ctx: &Context) -> PathBuf {
    ctx.paths()
        .networkd_dir
        .join(format!("90-phantom-{VPN_INTERFACE}.network"))
}

/// networkd unit binding the exit rules to the secondary interface.
#[must_use]
pub fn render_policy(subnet: Ipv4Net) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Match]\nName={VPN_INTERFACE}\n");
    out.push_str("[Network]\nConfigureWithoutCarrier=yes\nKeepConfiguration=yes\n\n");
    let _ = writeln!(
        out,
        "[RoutingPolicyRule]\nFrom={subnet}\nTo={subnet}\nTable=main\nPriority={PEER_PRIORITY}\n"
    );
    let _ = writeln!(
        out,
        "[RoutingPolicyRule]\nFrom={subnet}\nTable={TABLE_ID}\nPriority={EXIT_PRIORITY}\n"
    );
    let _ = writeln!(
        out,
        "[Route]\nDestination=0.0.0.0/0\nTable={TABLE_ID}\nScope=global"
    );
    out
}

/// Adds `100 multihop` to `rt_tables` unless a line already names the table.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn ensure_table(ctx: &Context) -> Result<bool> {
    let path = &ctx.paths().rt_tables;
    let mut contents = fs::read_optional(path)?.unwrap_or_default();
    let id = TABLE_ID.to_string();
    let present = contents.lines().any(|line| {
        let mut words = line.split_whitespace();
        let (number, name) = (words.next(), words.next());
        number == Some(id.as_str()) || name == Some(TABLE_NAME)
    });
    if present {
        return Ok(false);
    }
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    let _ = writeln!(contents, "{TABLE_ID} {TABLE_NAME}");
    fs::write_atomic(path, contents.as_bytes(), PUBLIC_MODE)?;
    info!(table = TABLE_NAME, "routing table registered");
    Ok(true)
}

/// Writes the networkd policy and asks networkd to pick it up. Only the
/// file write can fail; networkd problems are logged because the
/// imperative rules carry the live routing either way.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn install_policy(ctx: &Context, subnet: Ipv4Net) -> Result<()> {
    fs::write_atomic(
        &policy_path(ctx),
        render_policy(subnet).as_bytes(),
        PUBLIC_MODE,
    )?;
    ensure_table(ctx)?;

    let exec = ctx.executor();
    let networkd = Unit::new(exec, NETWORKD);
    if !networkd.is_active().await {
        for step in [networkd.enable().await, networkd.start().await] {
            if let Err(err) = step {
                warn!(error = %err, "could not start systemd-networkd");
            }
        }
    }
    reload_networkd(exec).await;
    let reconfigure = SystemCommand::new("networkctl").args(["reconfigure", VPN_INTERFACE]);
    if !exec.succeeds(&reconfigure).await {
        debug!("networkctl reconfigure failed");
    }
    info!(%subnet, "networkd policy installed");
    Ok(())
}

/// Removes the networkd policy. Returns whether a file was removed.
pub async fn remove_policy(ctx: &Context) -> bool {
    let removed = match fs::remove_file(&policy_path(ctx)) {
        Ok(removed) => removed,
        Err(err) => {
            warn!(error = %err, "could not remove networkd policy");
            false
        }
    };
    if removed {
        reload_networkd(ctx.executor()).await;
        info!("networkd policy removed");
    }
    removed
}

async fn reload_networkd(exec: &dyn Executor) {
    if exec
        .succeeds(&SystemCommand::new("networkctl").arg("reload"))
        .await
    {
        return;
    }
    if let Err(err) = Unit::new(exec, NETWORKD).restart().await {
        warn!(error = %err, "systemd-networkd reload failed");
    }
}

fn peer_rule(subnet: Ipv4Net) -> Vec<String> {
    vec![
        "from".to_string(),
        subnet.to_string(),
        "to".to_string(),
        subnet.to_string(),
        "table".to_string(),
        "main".to_string(),
        "priority".to_string(),
        PEER_PRIORITY.to_string(),
    ]
}

fn exit_rule(subnet: Ipv4Net) -> Vec<String> {
    vec![
        "from".to_string(),
        subnet.to_string(),
        "table".to_string(),
        TABLE_NAME.to_string(),
        "priority".to_string(),
        EXIT_PRIORITY.to_string(),
    ]
}

fn ip_rule(op: &str, selector: Vec<String>) -> SystemCommand {
    SystemCommand::new("ip").args(["rule", op]).args(selector)
}

fn default_route(op: &str) -> SystemCommand {
    SystemCommand::new("ip").args([
        "route",
        op,
        "default",
        "dev",
        VPN_INTERFACE,
        "table",
        TABLE_NAME,
    ])
}

/// Installs the live rules and the exit table's default route.
///
/// # Errors
///
/// Returns an error if a rule or route is refused.
pub async fn apply_rules(exec: &dyn Executor, subnet: Ipv4Net) -> Result<()> {
    remove_rules(exec, subnet).await;
    exec.check(&ip_rule("add", peer_rule(subnet))).await?;
    exec.check(&ip_rule("add", exit_rule(subnet))).await?;
    exec.check(&default_route("replace")).await?;
    flush_cache(exec).await;
    info!(%subnet, table = TABLE_NAME, "policy rules applied");
    Ok(())
}

/// Removes the live rules and route. Returns how many items were deleted.
pub async fn remove_rules(exec: &dyn Executor, subnet: Ipv4Net) -> usize {
    let mut removed = 0;
    for selector in [peer_rule(subnet), exit_rule(subnet)] {
        for _ in 0..MAX_DUPLICATES {
            if !exec.succeeds(&ip_rule("del", selector.clone())).await {
                break;
            }
            removed += 1;
        }
    }
    if exec.succeeds(&default_route("del")).await {
        removed += 1;
    }
    let flush = SystemCommand::new("ip").args(["route", "flush", "table", TABLE_NAME]);
    if !exec.succeeds(&flush).await {
        debug!("multihop table already empty");
    }
    removed
}

async fn flush_cache(exec: &dyn Executor) {
    let cmd = SystemCommand::new("ip").args(["route", "flush", "cache"]);
    if !exec.succeeds(&cmd).await {
        debug!("route cache flush failed");
    }
}

/// NAT and forwarding rules for traffic between the main interface and the
/// exit.
#[must_use]
pub fn forwarding_rules(main: &str, subnet: Ipv4Net) -> Vec<IptablesRule> {
    let masquerade = IptablesRule::masquerade(subnet, VPN_INTERFACE);
    let subnet = subnet.to_string();
    vec![
        masquerade,
        IptablesRule::filter(
            "FORWARD",
            ["-i", main, "-o", VPN_INTERFACE, "-j", "ACCEPT"],
        ),
        IptablesRule::filter(
            "FORWARD",
            [
                "-i",
                VPN_INTERFACE,
                "-o",
                main,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ),
        IptablesRule::filter(
            "FORWARD",
            [
                "-i",
                main,
                "-o",
                main,
                "-s",
                subnet.as_str(),
                "-d",
                subnet.as_str(),
                "-j",
                "ACCEPT",
            ],
        ),
    ]
}

/// Enables IPv4 forwarding and installs [`forwarding_rules`].
///
/// # Errors
///
/// Returns an error if iptables refuses a rule.
pub async fn apply_forwarding(exec: &dyn Executor, main: &str, subnet: Ipv4Net) -> Result<()> {
    let sysctl = SystemCommand::new("sysctl").args(["-w", "net.ipv4.ip_forward=1"]);
    if !exec.succeeds(&sysctl).await {
        warn!("could not enable ip_forward");
    }
    for rule in forwarding_rules(main, subnet) {
        rule.ensure(exec, Position::Append).await?;
    }
    Ok(())
}

/// Removes [`forwarding_rules`]. Returns how many rules were deleted.
pub async fn remove_forwarding(exec: &dyn Executor, main: &str, subnet: Ipv4Net) -> usize {
    let mut removed = 0;
    for rule in forwarding_rules(main, subnet) {
        removed += rule.remove(exec).await;
    }
    removed
}

/// Leftover exit state on the host, empty when clean.
pub async fn residue(exec: &dyn Executor, subnet: Ipv4Net) -> Vec<String> {
    let mut found = Vec::new();
    let from = format!("from {subnet}");
    if let Ok(rules) = exec.stdout(&SystemCommand::new("ip").args(["rule", "show"])).await {
        found.extend(
            rules
                .lines()
                .filter(|l| l.contains(&from) || l.contains(&format!("lookup {TABLE_NAME}")))
                .map(|l| format!("ip rule: {}", l.trim())),
        );
    }
    let subnet = subnet.to_string();
    found.extend(
        firewall::list_rules(exec, "nat", Some("POSTROUTING"))
            .await
            .into_iter()
            .filter(|l| l.contains(&subnet) && l.contains(VPN_INTERFACE))
            .map(|l| format!("nat: {l}")),
    );
    found
}

/// Removes rules and forwarding, then re-checks up to three times. Returns
/// whatever could not be removed.
pub async fn force_clean(exec: &dyn Executor, main: &str, subnet: Ipv4Net) -> Vec<String> {
    let mut left = residue(exec, subnet).await;
    for pass in 1..=MAX_FORCE_PASSES {
        if left.is_empty() {
            break;
        }
        warn!(pass, remaining = left.len(), "multihop residue found, cleaning again");
        remove_rules(exec, subnet).await;
        remove_forwarding(exec, main, subnet).await;
        flush_cache(exec).await;
        left = residue(exec, subnet).await;
    }
    left
}
