//! Ghost mode actions: enable, disable and status over the wstunnel
//! server, its certificate and the firewall it opens.

use chrono::{DateTime, Utc};
use phantom_core::systemd;
use phantom_core::{
    validate, Context, GhostState, PhantomError, Result, DEFAULT_PORT, GHOST_PORT,
};
use phantom_system::alphanumeric;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{certificate, filter, resolve, tunnel};

/// Length of the upgrade-path secret.
pub const SECRET_LEN: usize = 64;

const PROTOCOL: &str = "wss";
const EXPORT_HINT: &str = "To export client configuration, use: phantom-casper [username]";

/// Result of `enable`.
#[derive(Debug, Clone, Serialize)]
pub struct GhostEnabled {
    /// `active`.
    pub status: &'static str,
    /// Public address of this server.
    pub server_ip: String,
    /// Domain the certificate covers.
    pub domain: String,
    /// Upgrade-path secret.
    pub secret: String,
    /// Always `wss`.
    pub protocol: &'static str,
    /// TLS port.
    pub port: u16,
    /// Activation time.
    pub activated_at: DateTime<Utc>,
    /// Client-side wstunnel invocation.
    pub connection_command: String,
}

/// Result of `disable`.
#[derive(Debug, Clone, Serialize)]
pub struct GhostDisabled {
    /// `inactive`.
    pub status: &'static str,
    /// Summary.
    pub message: String,
    /// What was undone.
    pub restored: Vec<String>,
}

/// Services block of an active status.
#[derive(Debug, Clone, Serialize)]
pub struct GhostServices {
    /// `active` or `inactive`.
    pub wstunnel: &'static str,
}

/// Result of `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GhostStatus {
    /// Ghost mode is off.
    Inactive {
        /// `inactive`.
        status: &'static str,
        /// Always false.
        enabled: bool,
        /// Summary.
        message: String,
    },
    /// Ghost mode is on; `status` is `error` when the tunnel is down.
    Active {
        /// `active` or `error`.
        status: &'static str,
        /// Always true.
        enabled: bool,
        /// Public address of this server.
        server_ip: String,
        /// Domain the certificate covers.
        domain: String,
        /// First ten characters of the secret.
        secret: String,
        /// Always `wss`.
        protocol: &'static str,
        /// TLS port.
        port: u16,
        /// Service states.
        services: GhostServices,
        /// Activation time.
        activated_at: Option<DateTime<Utc>>,
        /// Client-side wstunnel invocation.
        connection_command: String,
        /// How to get a client config for this mode.
        client_export_info: &'static str,
    },
}

impl GhostStatus {
    /// Returns true if ghost mode is enabled, healthy or not.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// Handler for the `ghost` module.
#[derive(Clone, Debug)]
pub struct GhostModule {
    ctx: Context,
}

impl GhostModule {
    /// Creates the handler.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    fn load(&self) -> Result<Option<GhostState>> {
        GhostState::load(&self.ctx.paths().ghost_state())
    }

    /// Turns ghost mode on for `domain`.
    ///
    /// Nothing is written until the domain is shown to resolve to this host.
    /// From then on every change is logged in the state file and undone if
    /// a later step fails.
    ///
    /// # Errors
    ///
    /// - [`PhantomError::Validation`] for a malformed domain or a missing or
    ///   wrong A record
    /// - [`PhantomError::GhostModeActive`] if already enabled
    /// - [`PhantomError::GhostMode`] if setup fails (after rollback)
    pub async fn enable(&self, domain: &str) -> Result<GhostEnabled> {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(PhantomError::validation("Domain is required for Ghost Mode"));
        }
        validate::domain(&domain)?;

        let previous = self.load()?;
        if let Some(current) = previous.as_ref().filter(|s| s.enabled) {
            return Err(PhantomError::GhostModeActive {
                details: json!({
                    "server_ip": current.server_ip,
                    "domain": current.domain,
                    "secret": current.secret,
                    "protocol": PROTOCOL,
                    "activated_at": current.activated_at,
                    "connection_command": current.connection_command(),
                }),
            });
        }

        if let Some(stale) = previous {
            warn!(domain = %stale.domain, "clearing leftovers of an unfinished setup");
            self.teardown(&stale).await;
        }

        let exec = self.ctx.executor();
        let server_ip = resolve::public_ip(exec).await.ok_or_else(|| {
            PhantomError::GhostMode("Could not determine server public IP address".to_string())
        })?;
        if !resolve::a_record_points_to(exec, &domain, server_ip).await {
            return Err(PhantomError::validation(format!(
                "Domain {domain} does not have an A record pointing to {server_ip}. \
                 Please configure DNS first."
            )));
        }

        let mut state = GhostState {
            enabled: false,
            server_ip: server_ip.to_string(),
            domain: domain.clone(),
            secret: alphanumeric(self.ctx.random(), SECRET_LEN),
            installed_at: self.ctx.clock().now(),
            activated_at: None,
            changes: Default::default(),
        };
        let path = self.ctx.paths().ghost_state();
        state.save(&path)?;
        info!(domain = %domain, ip = %server_ip, "enabling ghost mode");

        if let Err(err) = self.setup(&mut state).await {
            error!(domain = %domain, error = %err, "ghost mode setup failed, rolling back");
            let restored = self.teardown(&state).await;
            info!(steps = restored.len(), "ghost mode rollback finished");
            return Err(PhantomError::GhostMode(format!(
                "Failed to enable Ghost Mode: {err}"
            )));
        }

        let activated_at = self.ctx.clock().now();
        state.enabled = true;
        state.activated_at = Some(activated_at);
        state.save(&path)?;
        info!(domain = %domain, "ghost mode active");

        Ok(GhostEnabled {
            status: "active",
            connection_command: state.connection_command(),
            server_ip: state.server_ip,
            domain: state.domain,
            secret: state.secret,
            protocol: PROTOCOL,
            port: GHOST_PORT,
            activated_at,
        })
    }

    async fn setup(&self, state: &mut GhostState) -> Result<()> {
        let ctx = &self.ctx;
        let wg_port = ctx.load_config()?.wireguard.port;

        let domain = state.domain.clone();
        let cert = certificate::obtain(ctx, &domain, &mut state.changes).await;
        self.checkpoint(state)?;
        let cert = cert?;

        let installed = tunnel::install(ctx, &mut state.changes).await;
        self.checkpoint(state)?;
        installed?;

        let secret = state.secret.clone();
        let configured = tunnel::configure(ctx, &secret, wg_port, &cert, &mut state.changes).await;
        self.checkpoint(state)?;
        configured?;

        let filtered = filter::apply(ctx.executor(), wg_port, &mut state.changes).await;
        self.checkpoint(state)?;
        filtered?;

        tunnel::start(ctx).await
    }

    /// Flushes the change log so a crash mid-way still leaves enough to
    /// clean up, then honours cancellation.
    fn checkpoint(&self, state: &GhostState) -> Result<()> {
        state.save(&self.ctx.paths().ghost_state())?;
        if self.ctx.cancel().is_cancelled() {
            return Err(PhantomError::GhostMode("operation cancelled".to_string()));
        }
        Ok(())
    }

    /// Undoes everything `state.changes` records. Never fails; problems are
    /// logged and skipped.
    async fn teardown(&self, state: &GhostState) -> Vec<String> {
        let ctx = &self.ctx;
        let paths = ctx.paths();
        let exec = ctx.executor();
        let changes = &state.changes;

        let mut restored = tunnel::stop(ctx).await;

        for file in &changes.files_created {
            match phantom_system::fs::remove_file(std::path::Path::new(file)) {
                Ok(true) => restored.push(format!("removed {file}")),
                Ok(false) => {}
                Err(err) => warn!(file = %file, error = %err, "could not remove file"),
            }
        }
        if changes.packages_installed.iter().any(|p| p == tunnel::UNIT) {
            match phantom_system::fs::remove_dir_all(&paths.wstunnel_dir) {
                Ok(true) => restored.push("wstunnel binary removed".to_string()),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "could not remove wstunnel directory"),
            }
        }
        if !changes.services_added.is_empty() {
            if let Err(err) = systemd::daemon_reload(exec).await {
                warn!(error = %err, "daemon-reload failed");
            }
        }

        let wg_port = ctx
            .load_config()
            .map(|c| c.wireguard.port)
            .unwrap_or(DEFAULT_PORT);
        restored.extend(filter::restore(exec, wg_port, changes).await);

        for domain in &changes.certificates_created {
            if certificate::remove(&paths.letsencrypt_dir, domain) {
                restored.push(format!("certificate for {domain} removed"));
            }
        }

        if let Err(err) = GhostState::remove(&paths.ghost_state()) {
            warn!(error = %err, "could not remove ghost state");
        }
        restored
    }

    /// Turns ghost mode off and removes everything it installed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state file is unreadable.
    pub async fn disable(&self) -> Result<GhostDisabled> {
        let Some(state) = self.load()? else {
            return Ok(GhostDisabled {
                status: "inactive",
                message: "Ghost Mode is not active".to_string(),
                restored: Vec::new(),
            });
        };
        info!(domain = %state.domain, "disabling ghost mode");
        let restored = self.teardown(&state).await;
        info!(steps = restored.len(), "ghost mode disabled");
        Ok(GhostDisabled {
            status: "inactive",
            message: "Ghost Mode disabled successfully".to_string(),
            restored,
        })
    }

    /// Current mode and tunnel health.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state file is unreadable.
    pub async fn status(&self) -> Result<GhostStatus> {
        let Some(state) = self.load()?.filter(|s| s.enabled) else {
            return Ok(GhostStatus::Inactive {
                status: "inactive",
                enabled: false,
                message: "Ghost Mode is not active".to_string(),
            });
        };
        let wstunnel = tunnel::state(&self.ctx).await;
        let secret: String = state.secret.chars().take(10).collect();
        Ok(GhostStatus::Active {
            status: if wstunnel == "active" { "active" } else { "error" },
            enabled: true,
            connection_command: state.connection_command(),
            server_ip: state.server_ip,
            domain: state.domain,
            secret: format!("{secret}..."),
            protocol: PROTOCOL,
            port: GHOST_PORT,
            services: GhostServices { wstunnel },
            activated_at: state.activated_at,
            client_export_info: EXPORT_HINT,
        })
    }
}
