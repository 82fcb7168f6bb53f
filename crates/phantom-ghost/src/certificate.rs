//! TLS certificate for the tunnel endpoint.
//!
//! Production hosts get a Let's Encrypt certificate through certbot's
//! standalone authenticator, which needs port 80 reachable for the duration
//! of the challenge. Test mode issues a self-signed pair in the same layout.

use std::path::{Path, PathBuf};

use phantom_core::{firewall, Context, GhostChanges, PhantomError, Result};
use phantom_system::{ExecutorExt, SystemCommand};
use tracing::{info, warn};

use crate::filter::UFW_HTTP_CHALLENGE;

/// Certificate and key paths for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// `live/<domain>/fullchain.pem`.
    pub fullchain: PathBuf,
    /// `live/<domain>/privkey.pem`.
    pub privkey: PathBuf,
}

impl CertPaths {
    /// Layout under a certbot configuration directory.
    #[must_use]
    pub fn new(letsencrypt_dir: &Path, domain: &str) -> Self {
        let live = letsencrypt_dir.join("live").join(domain);
        Self {
            fullchain: live.join("fullchain.pem"),
            privkey: live.join("privkey.pem"),
        }
    }

    fn present(&self) -> bool {
        self.fullchain.is_file() && self.privkey.is_file()
    }
}

fn issue_command(letsencrypt_dir: &Path, domain: &str, test_mode: bool) -> SystemCommand {
    if test_mode {
        let cert = CertPaths::new(letsencrypt_dir, domain);
        return SystemCommand::new("openssl").args([
            "req".to_string(),
            "-x509".to_string(),
            "-newkey".to_string(),
            "rsa:4096".to_string(),
            "-keyout".to_string(),
            cert.privkey.display().to_string(),
            "-out".to_string(),
            cert.fullchain.display().to_string(),
            "-days".to_string(),
            "365".to_string(),
            "-nodes".to_string(),
            "-subj".to_string(),
            format!("/CN={domain}"),
        ]);
    }
    SystemCommand::new("certbot").args([
        "certonly".to_string(),
        "--standalone".to_string(),
        "-d".to_string(),
        domain.to_string(),
        "--non-interactive".to_string(),
        "--agree-tos".to_string(),
        "--register-unsafely-without-email".to_string(),
        "--keep-until-expiring".to_string(),
        "--config-dir".to_string(),
        letsencrypt_dir.display().to_string(),
    ])
}

async fn ensure_certbot(ctx: &Context) -> Result<()> {
    let exec = ctx.executor();
    if exec.succeeds(&SystemCommand::new("certbot").arg("--version")).await {
        return Ok(());
    }
    info!("installing certbot");
    exec.check(&SystemCommand::new("apt-get").args(["update", "-qq"]))
        .await?;
    exec.check(&SystemCommand::new("apt-get").args(["install", "-y", "-qq", "certbot"]))
        .await?;
    Ok(())
}

/// Obtains a certificate for `domain` and records it in `changes`.
///
/// # Errors
///
/// [`PhantomError::GhostMode`] if no certificate pair ends up on disk.
pub async fn obtain(ctx: &Context, domain: &str, changes: &mut GhostChanges) -> Result<CertPaths> {
    let le = &ctx.paths().letsencrypt_dir;
    let cert = CertPaths::new(le, domain);
    let exec = ctx.executor();

    if ctx.settings().test_mode {
        if let Some(dir) = cert.fullchain.parent() {
            phantom_system::fs::create_dir_all(dir)?;
        }
        exec.check(&issue_command(le, domain, true)).await?;
    } else {
        ensure_certbot(ctx).await?;
        let opened = firewall::ufw_active(exec).await;
        if opened {
            firewall::ufw(exec, &["allow", "80/tcp"]).await?;
            changes.firewall_modified.push(UFW_HTTP_CHALLENGE.to_string());
        }
        let issued = exec.check(&issue_command(le, domain, false)).await;
        if opened {
            match firewall::ufw(exec, &["delete", "allow", "80/tcp"]).await {
                Ok(()) => changes.firewall_modified.retain(|c| c != UFW_HTTP_CHALLENGE),
                Err(err) => warn!(error = %err, "could not close port 80 after certificate challenge"),
            }
        }
        issued?;
    }

    changes.certificates_created.push(domain.to_string());
    if !cert.present() {
        return Err(PhantomError::GhostMode(format!(
            "Failed to obtain SSL certificate for {domain}"
        )));
    }
    info!(domain, self_signed = ctx.settings().test_mode, "certificate ready");
    Ok(cert)
}

/// Deletes the live, archive and renewal entries for `domain`.
pub fn remove(letsencrypt_dir: &Path, domain: &str) -> bool {
    let targets = [
        letsencrypt_dir.join("live").join(domain),
        letsencrypt_dir.join("archive").join(domain),
    ];
    let mut removed = false;
    for dir in &targets {
        match phantom_system::fs::remove_dir_all(dir) {
            Ok(r) => removed |= r,
            Err(err) => warn!(path = %dir.display(), error = %err, "certificate cleanup failed"),
        }
    }
    let renewal = letsencrypt_dir.join("renewal").join(format!("{domain}.conf"));
    match phantom_system::fs::remove_file(&renewal) {
        Ok(r) => removed |= r,
        Err(err) => warn!(path = %renewal.display(), error = %err, "certificate cleanup failed"),
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_core::testing::Sandbox;
    use phantom_system::CommandOutput;

    #[test]
    fn self_signed_command_targets_live_dir() {
        let cmd = issue_command(Path::new("/etc/letsencrypt"), "vpn.example.com", true);
        assert_eq!(
            cmd.to_string(),
            "openssl req -x509 -newkey rsa:4096 \
             -keyout /etc/letsencrypt/live/vpn.example.com/privkey.pem \
             -out /etc/letsencrypt/live/vpn.example.com/fullchain.pem \
             -days 365 -nodes -subj /CN=vpn.example.com"
        );
    }

    #[test]
    fn certbot_command() {
        let cmd = issue_command(Path::new("/etc/letsencrypt"), "vpn.example.com", false);
        assert!(cmd.to_string().starts_with(
            "certbot certonly --standalone -d vpn.example.com --non-interactive --agree-tos"
        ));
        assert!(cmd.arguments().iter().any(|a| a == "--keep-until-expiring"));
    }

    #[tokio::test]
    async fn challenge_port_is_closed_after_issuance() {
        let sandbox = Sandbox::new();
        sandbox
            .exec()
            .on("ufw status", CommandOutput::ok("Status: active\n"));
        let mut changes = GhostChanges::default();
        let _ = obtain(&sandbox.ctx(), "vpn.example.com", &mut changes).await;
        assert!(sandbox.exec().was_called("ufw allow 80/tcp"));
        assert!(sandbox.exec().was_called("ufw delete allow 80/tcp"));
        assert!(!changes.firewall_modified.iter().any(|c| c == UFW_HTTP_CHALLENGE));
    }

    #[tokio::test]
    async fn stuck_challenge_port_is_left_for_restore() {
        let sandbox = Sandbox::new();
        sandbox
            .exec()
            .on("ufw status", CommandOutput::ok("Status: active\n"))
            .on("ufw delete allow 80/tcp", CommandOutput::failed(1, "ERROR: busy"));
        let ctx = sandbox.ctx();
        let mut changes = GhostChanges::default();
        let _ = obtain(&ctx, "vpn.example.com", &mut changes).await;
        assert!(changes.firewall_modified.iter().any(|c| c == UFW_HTTP_CHALLENGE));

        sandbox.exec().clear_calls();
        let restored = crate::filter::restore(ctx.executor(), 51820, &changes).await;
        assert!(sandbox.exec().was_called("ufw --force delete allow 80/tcp"));
        assert!(restored.contains(&"ufw 80/tcp challenge rule removed".to_string()));
    }

    #[test]
    fn remove_clears_every_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        let le = dir.path();
        for sub in ["live/vpn.example.com", "archive/vpn.example.com", "renewal"] {
            std::fs::create_dir_all(le.join(sub)).expect("mkdir");
        }
        std::fs::write(le.join("renewal/vpn.example.com.conf"), "x").expect("write");
        std::fs::write(le.join("renewal/other.conf"), "x").expect("write");

        assert!(remove(le, "vpn.example.com"));
        assert!(!le.join("live/vpn.example.com").exists());
        assert!(!le.join("archive/vpn.example.com").exists());
        assert!(!le.join("renewal/vpn.example.com.conf").exists());
        assert!(le.join("renewal/other.conf").exists());
        assert!(!remove(le, "vpn.example.com"));
    }
}
