//! The secondary interface that carries traffic to the exit.

use std::path::PathBuf;

use ipnet::IpNet;
use phantom_core::{Context, PhantomError, Result};
use phantom_system::fs::{self, PRIVATE_MODE};
use phantom_system::{Executor, ExecutorExt, PollError, SystemCommand};
use phantom_wireguard::{parse_latest_handshakes, InterfaceConfig};
use serde_json::json;
use tracing::{debug, info, warn};

/// Name of the secondary interface.
pub const VPN_INTERFACE: &str = "wg_vpn";

/// MTU of the secondary interface, leaving room for double encapsulation.
pub const VPN_MTU: u16 = 1420;

/// Handshakes older than this no longer count as live.
pub const STALE_HANDSHAKE_SECS: i64 = 180;

/// Kernel config written for `wg setconf`.
#[must_use]
pub fn kernel_config_path(ctx: &Context) -> PathBuf {
    ctx.paths().wg_config(VPN_INTERFACE)
}

fn ip(args: &[&str]) -> SystemCommand {
    SystemCommand::new("ip").args(args.iter().copied())
}

fn wg_show(extra: Option<&str>) -> SystemCommand {
    let cmd = SystemCommand::new("wg").args(["show", VPN_INTERFACE]);
    match extra {
        Some(arg) => cmd.arg(arg),
        None => cmd,
    }
}

/// Creates the interface from an exit config and brings it up.
///
/// # Errors
///
/// [`PhantomError::VpnConfig`] if the exit has no IPv4 address, or the
/// failing command's error.
pub async fn bring_up(ctx: &Context, exit: &InterfaceConfig) -> Result<IpNet> {
    let address = exit.ipv4_address().ok_or_else(|| {
        PhantomError::VpnConfig(
            "Failed to parse VPN config - missing or invalid Address field".to_string(),
        )
    })?;
    let path = kernel_config_path(ctx);
    fs::write_atomic(&path, exit.render_kernel().as_bytes(), PRIVATE_MODE)?;

    let exec = ctx.executor();
    if exec.succeeds(&ip(&["link", "del", VPN_INTERFACE])).await {
        debug!("removed stale {VPN_INTERFACE}");
    }
    let path = path.display().to_string();
    let address_arg = address.to_string();
    let mtu = VPN_MTU.to_string();
    for cmd in [
        ip(&["link", "add", VPN_INTERFACE, "type", "wireguard"]),
        SystemCommand::new("wg").args(["setconf", VPN_INTERFACE, path.as_str()]),
        ip(&["-4", "address", "add", address_arg.as_str(), "dev", VPN_INTERFACE]),
        ip(&["link", "set", "mtu", mtu.as_str(), "up", "dev", VPN_INTERFACE]),
    ] {
        exec.check(&cmd).await.map_err(|err| {
            PhantomError::multihop(format!("Failed to configure {VPN_INTERFACE}: {err}"))
        })?;
    }
    info!(interface = VPN_INTERFACE, %address, "exit interface up");
    Ok(address)
}

/// Deletes the interface and its kernel config. Returns true if the link
/// existed.
pub async fn tear_down(ctx: &Context) -> bool {
    let exec = ctx.executor();
    let existed = exec.succeeds(&ip(&["link", "del", VPN_INTERFACE])).await;
    if let Err(err) = fs::remove_file(&kernel_config_path(ctx)) {
        warn!(error = %err, "could not remove exit kernel config");
    }
    if existed {
        info!(interface = VPN_INTERFACE, "exit interface removed");
    }
    existed
}

/// Returns true if the link exists.
pub async fn link_exists(exec: &dyn Executor) -> bool {
    exec.succeeds(&ip(&["link", "show", VPN_INTERFACE])).await
}

/// Most recent handshake with the exit, as unix time.
pub async fn latest_handshake(exec: &dyn Executor) -> Option<i64> {
    let out = exec.stdout(&wg_show(Some("latest-handshakes"))).await.ok()?;
    parse_latest_handshakes(&out).into_iter().map(|(_, ts)| ts).max()
}

/// Seconds since the last handshake, `None` if there never was one.
pub async fn handshake_age(ctx: &Context) -> Option<i64> {
    let ts = latest_handshake(ctx.executor()).await?;
    Some((ctx.clock().unix() - ts).max(0))
}

/// `wg show wg_vpn`, or the error text when the interface is missing.
pub async fn show(exec: &dyn Executor) -> std::result::Result<String, String> {
    match exec.run(&wg_show(None)).await {
        Ok(out) if out.success() => Ok(out.stdout),
        Ok(out) => Err(out.stderr.trim().to_string()),
        Err(err) => Err(err.to_string()),
    }
}

/// Returns true if `wg show` reports a handshake.
pub async fn has_handshake(exec: &dyn Executor) -> bool {
    show(exec)
        .await
        .is_ok_and(|out| out.contains("latest handshake"))
}

/// Waits for the first handshake with the exit.
///
/// # Errors
///
/// [`PhantomError::Multihop`] on timeout or cancellation.
pub async fn wait_for_handshake(ctx: &Context) -> Result<u32> {
    let exec = ctx.executor();
    let poll = ctx.settings().timeouts.handshake;
    let outcome = poll
        .until(ctx.cancel(), || async move { latest_handshake(exec).await.is_some() })
        .await;
    match outcome {
        Ok(attempts) => {
            info!(attempts, "exit handshake established");
            Ok(attempts)
        }
        Err(PollError::TimedOut(waited)) => Err(PhantomError::Multihop {
            message: "VPN handshake timeout - server may be unreachable or overloaded".to_string(),
            details: Some(json!({
                "interface": VPN_INTERFACE,
                "waited_secs": waited.as_secs(),
            })),
        }),
        Err(PollError::Cancelled) => Err(PhantomError::multihop("Multihop enable cancelled")),
    }
}
