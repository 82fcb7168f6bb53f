//! The main WireGuard interface: its `wg-quick` file and its kernel state.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::IpNet;
use phantom_system::fs::{self, PRIVATE_MODE};
use phantom_system::{Executor, ExecutorExt, SystemCommand};
use phantom_wireguard::{parse_dump, parse_wg_config, InterfaceConfig, InterfaceDump, PeerConfig, PublicKey};
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{PhantomError, Result};
use crate::systemd::Unit;

/// Main interface handle.
pub struct MainInterface<'a> {
    ctx: &'a Context,
    name: String,
}

impl<'a> MainInterface<'a> {
    /// Handle for interface `name`.
    pub fn new(ctx: &'a Context, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the `wg-quick` file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.ctx.paths().wg_config(&self.name)
    }

    /// systemd unit managing the interface.
    #[must_use]
    pub fn service_name(&self) -> String {
        format!("wg-quick@{}", self.name)
    }

    /// The managing unit.
    #[must_use]
    pub fn unit(&self) -> Unit<'a> {
        Unit::new(self.ctx.executor(), self.service_name())
    }

    fn executor(&self) -> &'a dyn Executor {
        self.ctx.executor()
    }

    /// Raw file contents, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read_raw(&self) -> Result<Option<String>> {
        Ok(fs::read_optional(&self.config_path())?)
    }

    /// Parses the interface file.
    ///
    /// # Errors
    ///
    /// [`PhantomError::Config`] if the file is missing or malformed.
    pub fn load(&self) -> Result<InterfaceConfig> {
        let path = self.config_path();
        let raw = fs::read_optional(&path)?.ok_or_else(|| {
            PhantomError::Config(format!("WireGuard config not found: {}", path.display()))
        })?;
        Ok(parse_wg_config(&raw)?)
    }

    /// Rewrites the interface file with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, config: &InterfaceConfig) -> Result<()> {
        self.write_raw(&config.render())
    }

    /// Writes raw contents with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_raw(&self, contents: &str) -> Result<()> {
        fs::write_atomic(&self.config_path(), contents.as_bytes(), PRIVATE_MODE)?;
        debug!(interface = %self.name, "interface file written");
        Ok(())
    }

    /// Installs one peer on the live interface. The preshared key travels
    /// on stdin so it never appears in the process list.
    ///
    /// # Errors
    ///
    /// Returns an error if `wg set` fails.
    pub async fn inject_peer(&self, peer: &PeerConfig) -> Result<()> {
        let allowed = peer
            .allowed_ips
            .iter()
            .map(IpNet::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut cmd = SystemCommand::new("wg").args([
            "set".to_string(),
            self.name.clone(),
            "peer".to_string(),
            peer.public_key.to_base64(),
        ]);
        if let Some(psk) = &peer.preshared_key {
            cmd = cmd
                .args(["preshared-key", "/dev/stdin"])
                .stdin(psk.to_base64());
        }
        cmd = cmd.args(["allowed-ips".to_string(), allowed]);
        self.executor().check(&cmd).await?;
        info!(interface = %self.name, peer = ?peer.public_key, "peer injected");
        Ok(())
    }

    /// Removes one peer from the live interface.
    ///
    /// # Errors
    ///
    /// Returns an error if `wg set` fails.
    pub async fn remove_peer(&self, key: &PublicKey) -> Result<()> {
        let cmd = SystemCommand::new("wg").args([
            "set".to_string(),
            self.name.clone(),
            "peer".to_string(),
            key.to_base64(),
            "remove".to_string(),
        ]);
        self.executor().check(&cmd).await?;
        info!(interface = %self.name, peer = ?key, "peer removed");
        Ok(())
    }

    /// Kernel state from `wg show <if> dump`.
    ///
    /// # Errors
    ///
    /// Returns an error if `wg` fails or prints something unparseable.
    pub async fn dump(&self) -> Result<InterfaceDump> {
        let cmd = SystemCommand::new("wg").args(["show", self.name.as_str(), "dump"]);
        let out = self.executor().stdout(&cmd).await?;
        Ok(parse_dump(&out)?)
    }

    /// Returns true if the link exists.
    pub async fn exists(&self) -> bool {
        let cmd = SystemCommand::new("ip").args(["link", "show", self.name.as_str()]);
        self.executor().succeeds(&cmd).await
    }

    /// Returns true if `wg show <if>` succeeds.
    pub async fn is_up(&self) -> bool {
        let cmd = SystemCommand::new("wg").args(["show", self.name.as_str()]);
        self.executor().succeeds(&cmd).await
    }

    /// IPv4 addresses on the link per `ip -4 -o addr show <if>`.
    pub async fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        let cmd = SystemCommand::new("ip").args(["-4", "-o", "addr", "show", self.name.as_str()]);
        match self.executor().stdout(&cmd).await {
            Ok(out) => host_addresses(&out).into_iter().map(|(_, ip)| ip).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Deletes the link.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip link delete` fails.
    pub async fn delete_link(&self) -> Result<()> {
        let cmd = SystemCommand::new("ip").args(["link", "delete", self.name.as_str()]);
        self.executor().check(&cmd).await?;
        Ok(())
    }

    /// `wg-quick down` then `wg-quick up`.
    ///
    /// # Errors
    ///
    /// Returns an error if `wg-quick up` fails.
    pub async fn bounce(&self) -> Result<()> {
        let down = SystemCommand::new("wg-quick").args(["down", self.name.as_str()]);
        let _ = self.executor().run(&down).await;
        let up = SystemCommand::new("wg-quick").args(["up", self.name.as_str()]);
        self.executor().check(&up).await?;
        Ok(())
    }

    /// Restarts the unit and waits for it to report active.
    ///
    /// # Errors
    ///
    /// [`PhantomError::ServiceOperation`] if it does not come back.
    pub async fn restart_and_wait(&self) -> Result<()> {
        let unit = self.unit();
        unit.restart().await?;
        self.ctx
            .settings()
            .timeouts
            .service_start
            .until(self.ctx.cancel(), || unit.is_active())
            .await
            .map_err(|err| {
                PhantomError::ServiceOperation(format!(
                    "{} did not become active: {err}",
                    unit.name()
                ))
            })?;
        Ok(())
    }
}

/// `(interface, address)` pairs from `ip -4 -o addr show` output.
#[must_use]
pub fn host_addresses(output: &str) -> Vec<(String, Ipv4Addr)> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let iface = fields.get(1)?.trim_end_matches(':');
            let inet = fields.iter().position(|f| *f == "inet")?;
            let cidr = fields.get(inet + 1)?;
            let ip = cidr.split('/').next()?.parse().ok()?;
            Some((iface.to_string(), ip))
        })
        .collect()
}

/// `(interface, network)` pairs from `ip -4 -o addr show` output.
#[must_use]
pub fn host_networks(output: &str) -> Vec<(String, ipnet::Ipv4Net)> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let iface = fields.get(1)?.trim_end_matches(':');
            let inet = fields.iter().position(|f| *f == "inet")?;
            let net: ipnet::Ipv4Net = fields.get(inet + 1)?.parse().ok()?;
            Some((iface.to_string(), net.trunc()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Sandbox;
    use phantom_system::CommandOutput;
    use phantom_wireguard::{PresharedKey, PrivateKey, KEY_SIZE};

    const ADDR_OUTPUT: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 203.0.113.5/24 brd 203.0.113.255 scope global eth0\\       valid_lft forever
5: wg_main    inet 10.8.0.1/24 scope global wg_main\\       valid_lft forever
";

    #[test]
    fn parses_ip_addr_output() {
        let addrs = host_addresses(ADDR_OUTPUT);
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[2], ("wg_main".to_string(), Ipv4Addr::new(10, 8, 0, 1)));
        let nets = host_networks(ADDR_OUTPUT);
        assert_eq!(nets[1].1.to_string(), "203.0.113.0/24");
    }

    #[tokio::test]
    async fn inject_passes_psk_on_stdin() {
        let sandbox = Sandbox::new();
        let ctx = sandbox.ctx();
        let iface = MainInterface::new(&ctx, "wg_main");
        let key = PrivateKey::from_entropy([3; KEY_SIZE]).public_key();
        let psk = PresharedKey::from_entropy([4; KEY_SIZE]);
        let peer = PeerConfig::new(key)
            .with_preshared_key(psk.clone())
            .with_allowed_ip("10.8.0.2/32".parse().expect("net"));
        iface.inject_peer(&peer).await.expect("inject");

        let cmds = sandbox.exec().commands();
        let wg = cmds.iter().find(|c| c.program() == "wg").expect("wg call");
        assert_eq!(
            wg.to_string(),
            format!(
                "wg set wg_main peer {} preshared-key /dev/stdin allowed-ips 10.8.0.2/32",
                key.to_base64()
            )
        );
        assert_eq!(wg.input(), Some(psk.to_base64().as_str()));
        assert!(!wg.to_string().contains(&psk.to_base64()));
    }

    #[tokio::test]
    async fn restart_waits_for_active() {
        let sandbox = Sandbox::new();
        sandbox.exec().on_sequence(
            "systemctl is-active wg-quick@wg_main",
            vec![CommandOutput::ok("activating"), CommandOutput::ok("active")],
        );
        let ctx = sandbox.ctx();
        MainInterface::new(&ctx, "wg_main")
            .restart_and_wait()
            .await
            .expect("restart");
        assert_eq!(
            sandbox.exec().calls_matching("systemctl is-active").len(),
            2
        );
    }

    #[test]
    fn load_reads_seeded_config() {
        let sandbox = Sandbox::new();
        let ctx = sandbox.ctx();
        let config = MainInterface::new(&ctx, "wg_main").load().expect("load");
        assert_eq!(config.listen_port, Some(51820));
        assert!(config.peers.is_empty());
    }
}
