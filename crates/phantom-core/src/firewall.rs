//! Packet filter primitives over `iptables` and `ufw`.
//!
//! Rules are idempotent: [`IptablesRule::ensure`] checks with `-C` before
//! adding and [`IptablesRule::remove`] deletes every duplicate.

use std::fmt;

use ipnet::Ipv4Net;
use phantom_system::{Executor, ExecutorExt, SystemCommand};
use tracing::{debug, info};

use crate::error::Result;

/// Upper bound on `-D` repetitions when clearing duplicates.
const MAX_DUPLICATES: usize = 16;

/// Where a new rule goes in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// `-A`: end of chain.
    Append,
    /// `-I`: top of chain.
    Insert,
}

/// One iptables rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    table: &'static str,
    chain: String,
    spec: Vec<String>,
}

impl IptablesRule {
    /// Rule in `table`/`chain` with match and target arguments.
    pub fn new<I, S>(table: &'static str, chain: impl Into<String>, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            chain: chain.into(),
            spec: spec.into_iter().map(Into::into).collect(),
        }
    }

    /// `filter` table rule.
    pub fn filter<I, S>(chain: impl Into<String>, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("filter", chain, spec)
    }

    /// Source NAT for `subnet` leaving through `out_interface`.
    #[must_use]
    pub fn masquerade(subnet: Ipv4Net, out_interface: &str) -> Self {
        Self::new(
            "nat",
            "POSTROUTING",
            [
                "-s".to_string(),
                subnet.to_string(),
                "-o".to_string(),
                out_interface.to_string(),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ],
        )
    }

    fn command(&self, op: &str) -> SystemCommand {
        SystemCommand::new("iptables")
            .args(["-t", self.table, op, self.chain.as_str()])
            .args(self.spec.iter().cloned())
    }

    /// Returns true if the rule is present.
    pub async fn exists(&self, executor: &dyn Executor) -> bool {
        executor.succeeds(&self.command("-C")).await
    }

    /// Adds the rule unless it is already present. Returns whether it was
    /// added.
    ///
    /// # Errors
    ///
    /// Returns an error if iptables refuses the rule.
    pub async fn ensure(&self, executor: &dyn Executor, position: Position) -> Result<bool> {
        if self.exists(executor).await {
            debug!(rule = %self, "rule already present");
            return Ok(false);
        }
        let op = match position {
            Position::Append => "-A",
            Position::Insert => "-I",
        };
        executor.check(&self.command(op)).await?;
        info!(rule = %self, "rule added");
        Ok(true)
    }

    /// Deletes every copy of the rule. Returns how many were removed.
    pub async fn remove(&self, executor: &dyn Executor) -> usize {
        let mut removed = 0;
        while removed < MAX_DUPLICATES && self.exists(executor).await {
            if !executor.succeeds(&self.command("-D")).await {
                break;
            }
            removed += 1;
        }
        if removed > 0 {
            info!(rule = %self, removed, "rule removed");
        }
        removed
    }
}

impl fmt::Display for IptablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Returns true if ufw is installed and enabled.
pub async fn ufw_active(executor: &dyn Executor) -> bool {
    match executor.run(&SystemCommand::new("ufw").arg("status")).await {
        Ok(out) => out.success() && out.stdout.contains("Status: active"),
        Err(_) => false,
    }
}

/// Runs `ufw <args>`.
///
/// # Errors
///
/// Returns an error if ufw fails.
pub async fn ufw(executor: &dyn Executor, args: &[&str]) -> Result<()> {
    executor
        .check(&SystemCommand::new("ufw").args(args.iter().copied()))
        .await?;
    debug!(args = ?args, "ufw");
    Ok(())
}

/// Rule lines from `ufw status` (header stripped); empty when inactive.
pub async fn ufw_rules(executor: &dyn Executor) -> Vec<String> {
    let Ok(out) = executor.run(&SystemCommand::new("ufw").arg("status")).await else {
        return Vec::new();
    };
    out.stdout
        .lines()
        .skip_while(|l| !l.starts_with("--"))
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect()
}

/// `iptables -t <table> -S [chain]` lines.
pub async fn list_rules(executor: &dyn Executor, table: &str, chain: Option<&str>) -> Vec<String> {
    let mut cmd = SystemCommand::new("iptables").args(["-t", table, "-S"]);
    if let Some(chain) = chain {
        cmd = cmd.arg(chain);
    }
    executor
        .stdout(&cmd)
        .await
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Interface carrying the default route, from `ip route show default`.
pub async fn default_route_interface(executor: &dyn Executor) -> Option<String> {
    let cmd = SystemCommand::new("ip").args(["route", "show", "default"]);
    let out = executor.stdout(&cmd).await.ok()?;
    out.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "dev" {
                return words.next().map(str::to_string);
            }
        }
        None
    })
}

/// Returns true if something listens on `port`/udp per `ss -ulpn`.
pub async fn udp_listening(executor: &dyn Executor, port: u16) -> bool {
    let needle = format!(":{port}");
    executor
        .stdout(&SystemCommand::new("ss").arg("-ulpn"))
        .await
        .map(|out| {
            out.lines().any(|l| {
                l.split_whitespace()
                    .any(|field| field.ends_with(&needle))
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_system::{CommandOutput, ScriptedExecutor};

    #[tokio::test]
    async fn ensure_skips_existing_rule() {
        let exec = ScriptedExecutor::new();
        let rule = IptablesRule::filter("INPUT", ["-p", "tcp", "--dport", "443", "-j", "ACCEPT"]);
        let added = rule.ensure(&exec, Position::Insert).await.expect("ensure");
        assert!(!added);
        assert_eq!(
            exec.calls(),
            vec!["iptables -t filter -C INPUT -p tcp --dport 443 -j ACCEPT"]
        );
    }

    #[tokio::test]
    async fn ensure_inserts_missing_rule() {
        let exec = ScriptedExecutor::new();
        exec.on("iptables -t filter -C", CommandOutput::failed(1, "Bad rule"));
        let rule = IptablesRule::filter("INPUT", ["-p", "udp", "--dport", "51820", "-j", "DROP"]);
        assert!(rule.ensure(&exec, Position::Append).await.expect("ensure"));
        assert!(exec.was_called("iptables -t filter -A INPUT -p udp --dport 51820 -j DROP"));
    }

    #[tokio::test]
    async fn remove_deletes_duplicates() {
        let exec = ScriptedExecutor::new();
        exec.on_sequence(
            "iptables -t nat -C",
            vec![
                CommandOutput::ok(""),
                CommandOutput::ok(""),
                CommandOutput::failed(1, ""),
            ],
        );
        let rule = IptablesRule::masquerade("10.8.0.0/24".parse().expect("net"), "eth0");
        assert_eq!(rule.remove(&exec).await, 2);
        assert_eq!(
            exec.calls_matching("iptables -t nat -D POSTROUTING -s 10.8.0.0/24 -o eth0").len(),
            2
        );
    }

    #[tokio::test]
    async fn ufw_detection_and_rules() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "ufw status",
            CommandOutput::ok(
                "Status: active\n\nTo                         Action      From\n--                         ------      ----\n51820/udp                  ALLOW       Anywhere\n443/tcp                    ALLOW       Anywhere\n",
            ),
        );
        assert!(ufw_active(&exec).await);
        assert_eq!(
            ufw_rules(&exec).await,
            vec![
                "51820/udp                  ALLOW       Anywhere",
                "443/tcp                    ALLOW       Anywhere"
            ]
        );
    }

    #[tokio::test]
    async fn default_interface_parsed() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "ip route show default",
            CommandOutput::ok("default via 203.0.113.1 dev ens3 proto dhcp metric 100\n"),
        );
        assert_eq!(default_route_interface(&exec).await.as_deref(), Some("ens3"));
    }

    #[tokio::test]
    async fn udp_port_listening() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "ss -ulpn",
            CommandOutput::ok("State Recv-Q Send-Q Local Address:Port\nUNCONN 0 0 0.0.0.0:51820 0.0.0.0:*\n"),
        );
        assert!(udp_listening(&exec, 51820).await);
        assert!(!udp_listening(&exec, 5182).await);
    }
}
