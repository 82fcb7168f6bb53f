//! Packet filter changes: 443/tcp in, WireGuard reachable from loopback only.

use phantom_core::firewall::{self, IptablesRule, Position};
use phantom_core::{GhostChanges, Result, GHOST_PORT};
use phantom_system::Executor;
use tracing::warn;

const UFW_HTTPS: &str = "ufw allow 443/tcp";
const UFW_LOOPBACK: &str = "ufw allow from 127.0.0.1 to wireguard port";
/// Recorded while the certbot challenge port is still open.
pub(crate) const UFW_HTTP_CHALLENGE: &str = "ufw allow 80/tcp";

fn https_accept() -> IptablesRule {
    IptablesRule::filter(
        "INPUT",
        [
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            GHOST_PORT.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
    )
}

fn wireguard_loopback(port: u16) -> IptablesRule {
    IptablesRule::filter(
        "INPUT",
        [
            "-p".to_string(),
            "udp".to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-s".to_string(),
            "127.0.0.1".to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
    )
}

fn wireguard_drop(port: u16) -> IptablesRule {
    IptablesRule::filter(
        "INPUT",
        [
            "-p".to_string(),
            "udp".to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ],
    )
}

/// Opens 443/tcp and restricts the WireGuard port to loopback. Every change
/// is appended to `changes` as soon as it is made.
pub async fn apply(executor: &dyn Executor, wg_port: u16, changes: &mut GhostChanges) -> Result<()> {
    if firewall::ufw_active(executor).await {
        let udp = format!("{wg_port}/udp");
        let port = wg_port.to_string();
        if let Err(err) = firewall::ufw(executor, &["delete", "allow", udp.as_str()]).await {
            warn!(error = %err, "no open wireguard rule to delete in ufw");
        }
        firewall::ufw(
            executor,
            &["allow", "from", "127.0.0.1", "to", "any", "port", port.as_str(), "proto", "udp"],
        )
        .await?;
        changes.wireguard_restricted = true;
        changes.firewall_modified.push(UFW_LOOPBACK.to_string());
        firewall::ufw(executor, &["allow", "443/tcp"]).await?;
        changes.firewall_modified.push(UFW_HTTPS.to_string());
    }

    // Inserted bottom-up so the loopback accept ends above the drop.
    for rule in [
        wireguard_drop(wg_port),
        wireguard_loopback(wg_port),
        https_accept(),
    ] {
        if rule.ensure(executor, Position::Insert).await? {
            changes.firewall_modified.push(format!("iptables {rule}"));
        }
    }
    Ok(())
}

/// Undoes [`apply`]. The iptables rules are removed whether or not they were
/// recorded. Returns a line per restored item.
pub async fn restore(executor: &dyn Executor, wg_port: u16, changes: &GhostChanges) -> Vec<String> {
    let mut restored = Vec::new();
    let udp = format!("{wg_port}/udp");
    let port = wg_port.to_string();

    if changes.firewall_modified.iter().any(|c| c == UFW_HTTPS) {
        match firewall::ufw(executor, &["--force", "delete", "allow", "443/tcp"]).await {
            Ok(()) => restored.push("ufw 443/tcp rule removed".to_string()),
            Err(err) => warn!(error = %err, "could not remove ufw 443 rule"),
        }
    }
    if changes.firewall_modified.iter().any(|c| c == UFW_HTTP_CHALLENGE) {
        match firewall::ufw(executor, &["--force", "delete", "allow", "80/tcp"]).await {
            Ok(()) => restored.push("ufw 80/tcp challenge rule removed".to_string()),
            Err(err) => warn!(error = %err, "could not remove ufw port 80 rule"),
        }
    }
    if changes.wireguard_restricted {
        let outcome = async {
            firewall::ufw(
                executor,
                &[
                    "--force", "delete", "allow", "from", "127.0.0.1", "to", "any", "port",
                    port.as_str(), "proto", "udp",
                ],
            )
            .await?;
            firewall::ufw(executor, &["allow", udp.as_str()]).await?;
            firewall::ufw(executor, &["reload"]).await
        }
        .await;
        match outcome {
            Ok(()) => restored.push(format!("ufw {udp} reopened")),
            Err(err) => warn!(error = %err, "could not restore ufw wireguard rule"),
        }
    }

    let mut removed = 0;
    for rule in [https_accept(), wireguard_loopback(wg_port), wireguard_drop(wg_port)] {
        removed += rule.remove(executor).await;
    }
    if removed > 0 {
        restored.push(format!("{removed} iptables rules removed"));
    }
    restored
}
