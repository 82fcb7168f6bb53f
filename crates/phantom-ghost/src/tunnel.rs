//! The wstunnel server: binary, unit file and service.

use std::path::{Path, PathBuf};

use phantom_core::systemd::{self, Unit};
use phantom_core::{Context, GhostChanges, PhantomError, Result, GHOST_PORT};
use phantom_system::fs::{self, PUBLIC_MODE};
use phantom_system::{ExecutorExt, SystemCommand};
use tracing::{debug, info, warn};

use crate::certificate::CertPaths;

/// Pinned wstunnel release.
pub const WSTUNNEL_VERSION: &str = "10.4.3";

/// systemd unit name.
pub const UNIT: &str = "wstunnel";

const RELEASES: &str = "https://github.com/erebe/wstunnel/releases/download";

/// Release architecture for a `uname -m` value.
#[must_use]
pub fn release_arch(machine: &str) -> Option<&'static str> {
    match machine.trim() {
        "x86_64" | "amd64" => Some("amd64"),
        "aarch64" | "arm64" => Some("arm64"),
        _ => None,
    }
}

/// Download URL and tarball name for `arch`.
#[must_use]
pub fn release_url(arch: &str) -> (String, String) {
    let tarball = format!("wstunnel_{WSTUNNEL_VERSION}_linux_{arch}.tar.gz");
    (
        format!("{RELEASES}/v{WSTUNNEL_VERSION}/{tarball}"),
        tarball,
    )
}

/// Installed binary.
#[must_use]
pub fn binary(wstunnel_dir: &Path) -> PathBuf {
    wstunnel_dir.join("wstunnel")
}

/// Unit file location.
#[must_use]
pub fn unit_path(systemd_dir: &Path) -> PathBuf {
    systemd_dir.join(format!("{UNIT}.service"))
}

/// Downloads and unpacks the release matching this host.
pub async fn install(ctx: &Context, changes: &mut GhostChanges) -> Result<()> {
    let exec = ctx.executor();
    let paths = ctx.paths();
    let machine = exec.stdout(&SystemCommand::new("uname").arg("-m")).await?;
    let arch = release_arch(&machine).ok_or_else(|| {
        PhantomError::GhostMode(format!("Unsupported architecture: {machine}"))
    })?;
    let (url, tarball) = release_url(arch);

    fs::create_dir_all(&paths.tmp_dir)?;
    let download = paths.tmp_dir.join(&tarball);
    let target = download.display().to_string();
    let fetched = exec
        .succeeds(&SystemCommand::new("wget").args(["-q", "-O", target.as_str(), url.as_str()]))
        .await
        || exec
            .succeeds(&SystemCommand::new("curl").args(["-fsSL", "-o", target.as_str(), url.as_str()]))
            .await;
    if !fetched {
        return Err(PhantomError::GhostMode(format!(
            "Failed to download wstunnel from {url}"
        )));
    }

    fs::create_dir_all(&paths.wstunnel_dir)?;
    changes.packages_installed.push(UNIT.to_string());
    let unpack = exec
        .check(
            &SystemCommand::new("tar")
                .args(["-xzf", target.as_str(), "-C"])
                .arg(paths.wstunnel_dir.display().to_string()),
        )
        .await;
    if let Err(err) = fs::remove_file(&download) {
        debug!(error = %err, "could not remove tarball");
    }
    unpack?;

    let bin = binary(&paths.wstunnel_dir);
    if !bin.is_file() {
        return Err(PhantomError::GhostMode(
            "wstunnel binary missing after extraction".to_string(),
        ));
    }
    make_executable(&bin)?;
    info!(version = WSTUNNEL_VERSION, arch, path = %bin.display(), "wstunnel installed");
    Ok(())
}

fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
        PhantomError::GhostMode(format!("cannot mark {} executable: {e}", path.display()))
    })
}

/// Unit file contents for the server.
#[must_use]
pub fn render_unit(wstunnel_dir: &Path, secret: &str, wg_port: u16, cert: &CertPaths) -> String {
    let exec_start = format!(
        "{bin} server --restrict-http-upgrade-path-prefix \"{secret}\" \
         --restrict-to 127.0.0.1:{wg_port} \
         --tls-certificate \"{chain}\" --tls-private-key \"{key}\" \
         wss://0.0.0.0:{GHOST_PORT}",
        bin = binary(wstunnel_dir).display(),
        chain = cert.fullchain.display(),
        key = cert.privkey.display(),
    );
    format!(
        "[Unit]
Description=wstunnel WebSocket tunnel for Phantom-WG ghost mode
After=network.target

[Service]
Type=simple
ExecStart={exec_start}
Restart=always
RestartSec=5
StandardOutput=journal
StandardError=journal
SyslogIdentifier={UNIT}
User=root
LimitNOFILE=65535
NoNewPrivileges=true
PrivateTmp=true
ProtectSystem=strict
ProtectHome=true
ReadWritePaths={dir}

[Install]
WantedBy=multi-user.target
",
        dir = wstunnel_dir.display(),
    )
}

/// Writes the unit file and reloads systemd.
pub async fn configure(
    ctx: &Context,
    secret: &str,
    wg_port: u16,
    cert: &CertPaths,
    changes: &mut GhostChanges,
) -> Result<()> {
    let paths = ctx.paths();
    let path = unit_path(&paths.systemd_dir);
    let unit = render_unit(&paths.wstunnel_dir, secret, wg_port, cert);
    fs::write_atomic(&path, unit.as_bytes(), PUBLIC_MODE)?;
    changes.files_created.push(path.display().to_string());
    changes.services_added.push(UNIT.to_string());
    systemd::daemon_reload(ctx.executor()).await
}

/// Enables and starts the service, then waits for it to report active.
pub async fn start(ctx: &Context) -> Result<()> {
    let unit = Unit::new(ctx.executor(), UNIT);
    unit.enable().await?;
    unit.start().await?;
    let unit = &unit;
    ctx.settings()
        .timeouts
        .service_start
        .until(ctx.cancel(), || async move { unit.is_active().await })
        .await
        .map_err(|err| PhantomError::GhostMode(format!("wstunnel service did not start: {err}")))?;
    info!("wstunnel running");
    Ok(())
}

/// Stops the service and kills stray processes. Returns what was done.
pub async fn stop(ctx: &Context) -> Vec<String> {
    let exec = ctx.executor();
    let unit = Unit::new(exec, UNIT);
    let mut done = Vec::new();
    if unit.stop().await.is_ok() {
        done.push("wstunnel service stopped".to_string());
    }
    if unit.disable().await.is_ok() {
        done.push("wstunnel service disabled".to_string());
    }
    // pkill exits 1 when nothing matched.
    if exec
        .succeeds(&SystemCommand::new("pkill").args(["-f", "wstunnel"]))
        .await
    {
        warn!("killed stray wstunnel processes");
    }
    done
}

/// Current `systemctl is-active` word for the service.
pub async fn state(ctx: &Context) -> &'static str {
    if Unit::new(ctx.executor(), UNIT).is_active().await {
        "active"
    } else {
        "inactive"
    }
}
