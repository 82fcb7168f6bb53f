//! Handshake monitor for the exit tunnel.
//!
//! Runs as its own systemd service (`phantom monitor`). Every check reloads
//! `phantom.json` and stops once multihop is off; otherwise it grades the
//! age of the last handshake and, when the handshake is stale, nudges
//! WireGuard into a new one.

use std::path::PathBuf;
use std::time::Duration;

use phantom_core::systemd::{self, Unit};
use phantom_core::{Context, PhantomError, Result};
use phantom_system::fs::{self, PUBLIC_MODE};
use phantom_system::{ExecutorExt, SystemCommand};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exits::ExitStore;
use crate::session::{Level, SessionLog};
use crate::tunnel::{self, STALE_HANDSHAKE_SECS, VPN_INTERFACE};

/// systemd unit running the monitor.
pub const MONITOR_UNIT: &str = "phantom-multihop-monitor";

/// Handshakes up to this age are healthy.
pub const GOOD_HANDSHAKE_SECS: i64 = 120;

/// Reconnection attempts per stale handshake.
pub const MAX_RECONNECTS: u32 = 3;

/// A handshake younger than this after a nudge counts as a reconnect.
const FRESH_HANDSHAKE_SECS: i64 = 10;

/// Path of the monitor unit file.
#[must_use]
pub fn unit_path(ctx: &Context) -> PathBuf {
    ctx.paths()
        .systemd_dir
        .join(format!("{MONITOR_UNIT}.service"))
}

/// Unit file running `exec_start` with the given log filter.
#[must_use]
pub fn render_unit(exec_start: &str, level: Level) -> String {
    format!(
        "[Unit]
Description=Phantom-WG multihop handshake monitor
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={exec_start}
Environment=MULTIHOP_LOG_LEVEL={level}
Restart=on-failure
RestartSec=10

[Install]
WantedBy=multi-user.target
"
    )
}

/// Writes the unit file if it changed, then restarts the monitor and waits
/// for it to come up.
///
/// # Errors
///
/// [`PhantomError::Multihop`] if the service does not start.
pub async fn start(ctx: &Context) -> Result<()> {
    let path = unit_path(ctx);
    let unit_file = render_unit(&ctx.settings().monitor_exec, Level::Info);
    if fs::read_optional(&path)?.as_deref() != Some(unit_file.as_str()) {
        fs::write_atomic(&path, unit_file.as_bytes(), PUBLIC_MODE)?;
        systemd::daemon_reload(ctx.executor()).await?;
    }

    let unit = Unit::new(ctx.executor(), MONITOR_UNIT);
    if let Err(err) = unit.stop().await {
        debug!(error = %err, "monitor was not running");
    }
    unit.start().await.map_err(|err| {
        PhantomError::multihop(format!("Failed to start multihop monitor service: {err}"))
    })?;
    let unit = &unit;
    ctx.settings()
        .timeouts
        .service_start
        .until(ctx.cancel(), || async move { unit.is_active().await })
        .await
        .map_err(|err| {
            PhantomError::multihop(format!("Multihop monitor service did not start: {err}"))
        })?;
    info!(unit = MONITOR_UNIT, "monitor running");
    Ok(())
}

/// Stops the monitor. Returns whether systemctl accepted the stop.
pub async fn stop(ctx: &Context) -> bool {
    match Unit::new(ctx.executor(), MONITOR_UNIT).stop().await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "monitor stop failed");
            false
        }
    }
}

/// `monitor_status` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    /// Whether the service is active.
    pub monitoring: bool,
    /// `systemd` when active.
    #[serde(rename = "type")]
    pub kind: Option<&'static str>,
    /// Main process id when active.
    pub pid: Option<u32>,
}

/// Current state of the monitor service.
pub async fn status(ctx: &Context) -> MonitorStatus {
    let unit = Unit::new(ctx.executor(), MONITOR_UNIT);
    if !unit.is_active().await {
        return MonitorStatus {
            monitoring: false,
            kind: None,
            pid: None,
        };
    }
    MonitorStatus {
        monitoring: true,
        kind: Some("systemd"),
        pid: unit.property("MainPID").await.and_then(|p| p.parse().ok()),
    }
}

/// Handshake grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No handshake at all.
    NoConnection,
    /// At most [`GOOD_HANDSHAKE_SECS`] old.
    Good(i64),
    /// At most [`STALE_HANDSHAKE_SECS`] old.
    Warning(i64),
    /// Older; a reconnect is due.
    Critical(i64),
}

impl Health {
    /// Grades a handshake age in seconds.
    #[must_use]
    pub const fn classify(age: Option<i64>) -> Self {
        match age {
            None => Self::NoConnection,
            Some(age) if age <= GOOD_HANDSHAKE_SECS => Self::Good(age),
            Some(age) if age <= STALE_HANDSHAKE_SECS => Self::Warning(age),
            Some(age) => Self::Critical(age),
        }
    }

    /// Session log level and line.
    #[must_use]
    pub fn entry(self) -> (Level, String) {
        match self {
            Self::NoConnection => (Level::Error, "Handshake: No connection".to_string()),
            Self::Good(age) => (Level::Info, format!("Handshake: {age}s [Good]")),
            Self::Warning(age) => (Level::Warning, format!("Handshake: {age}s [Warning]")),
            Self::Critical(age) => (Level::Error, format!("Handshake: {age}s [Critical]")),
        }
    }
}

/// What one check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Multihop is off; the monitor should exit.
    Stopped,
    /// Handshake graded, nothing else needed.
    Checked(Health),
    /// A stale handshake was renewed.
    Reconnected(i64),
    /// Every reconnection attempt failed.
    ReconnectFailed,
}

/// Pauses used by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Between checks.
    pub check: Duration,
    /// Between reconnection attempts.
    pub reconnect: Duration,
    /// After a nudge, before re-reading the handshake.
    pub settle: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            check: Duration::from_secs(30),
            reconnect: Duration::from_secs(10),
            settle: Duration::from_secs(2),
        }
    }
}

/// The monitor loop.
#[derive(Debug, Clone)]
pub struct Monitor {
    ctx: Context,
    log: SessionLog,
    intervals: Intervals,
}

impl Monitor {
    /// Monitor writing entries at or above `min_level` to the session log.
    #[must_use]
    pub fn new(ctx: Context, min_level: Level) -> Self {
        let log = SessionLog::new(ctx.paths().session_log()).with_min_level(min_level);
        Self {
            ctx,
            log,
            intervals: Intervals::default(),
        }
    }

    /// Overrides the pauses.
    #[must_use]
    pub fn with_intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }

    fn record(&self, level: Level, message: &str) {
        if let Err(err) = self.log.append(level, message, self.ctx.clock().now()) {
            warn!(error = %err, "could not write session log");
        }
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.ctx.cancel().cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    /// Runs checks until multihop is disabled or the context is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` becomes unreadable.
    pub async fn run(&self) -> Result<()> {
        info!(unit = MONITOR_UNIT, "monitor started");
        loop {
            if self.check_once().await? == Tick::Stopped {
                info!("multihop disabled, monitor exiting");
                return Ok(());
            }
            if !self.pause(self.intervals.check).await {
                info!("monitor cancelled");
                return Ok(());
            }
        }
    }

    /// One check: grade the handshake and reconnect if it is stale.
    ///
    /// # Errors
    ///
    /// Returns an error if `phantom.json` is unreadable.
    pub async fn check_once(&self) -> Result<Tick> {
        let multihop = self.ctx.load_config()?.multihop;
        let Some(exit) = multihop.active_exit.filter(|_| multihop.enabled) else {
            return Ok(Tick::Stopped);
        };

        let health = Health::classify(tunnel::handshake_age(&self.ctx).await);
        let (level, line) = health.entry();
        self.record(level, &line);
        debug!(exit = %exit, ?health, "handshake checked");

        let Health::Critical(age) = health else {
            return Ok(Tick::Checked(health));
        };
        self.record(
            Level::Warning,
            &format!("Handshake too old ({age}s), reconnecting..."),
        );
        Ok(match self.reconnect(&exit).await {
            Some(fresh) => Tick::Reconnected(fresh),
            None => Tick::ReconnectFailed,
        })
    }

    async fn fresh_handshake(&self) -> Option<i64> {
        tunnel::handshake_age(&self.ctx)
            .await
            .filter(|age| *age < FRESH_HANDSHAKE_SECS)
    }

    async fn reconnect(&self, exit: &str) -> Option<i64> {
        let exec = self.ctx.executor();
        let probe = ExitStore::new(self.ctx.paths().exit_configs_dir())
            .load(exit)
            .ok()
            .and_then(|c| c.ipv4_address())
            .map(|a| a.addr().to_string());

        for attempt in 1..=MAX_RECONNECTS {
            self.record(
                Level::Warning,
                &format!("Reconnection attempt {attempt}/{MAX_RECONNECTS}"),
            );
            let nudge = SystemCommand::new("wg").args(["set", VPN_INTERFACE, "listen-port", "0"]);
            if let Err(err) = exec.check(&nudge).await {
                warn!(error = %err, "wg set failed");
            }
            if !self.pause(self.intervals.settle).await {
                return None;
            }
            let mut fresh = self.fresh_handshake().await;

            if fresh.is_none() {
                if let Some(ip) = &probe {
                    let ping = SystemCommand::new("ping")
                        .args(["-c", "1", "-W", "2", "-I", VPN_INTERFACE, ip.as_str()]);
                    let _ = exec.succeeds(&ping).await;
                    if !self.pause(self.intervals.settle).await {
                        return None;
                    }
                    fresh = self.fresh_handshake().await;
                }
            }

            if let Some(age) = fresh {
                self.record(
                    Level::Success,
                    &format!("Reconnected - New handshake: {age}s"),
                );
                info!(attempt, age, "exit handshake renewed");
                return Some(age);
            }
            self.record(Level::Warning, &format!("Attempt {attempt} failed"));
            if attempt < MAX_RECONNECTS && !self.pause(self.intervals.reconnect).await {
                return None;
            }
        }
        self.record(Level::Error, "All reconnection attempts failed");
        warn!(exit, "exit handshake could not be renewed");
        None
    }
}
