//! `systemctl` and `journalctl` wrappers.

use phantom_system::{Executor, ExecutorExt, SystemCommand};
use tracing::{debug, info};

use crate::error::Result;

/// A systemd unit driven through `systemctl`.
pub struct Unit<'a> {
    executor: &'a dyn Executor,
    name: String,
}

impl<'a> Unit<'a> {
    /// Handle for `name` (e.g. `wg-quick@wg_main`).
    pub fn new(executor: &'a dyn Executor, name: impl Into<String>) -> Self {
        Self {
            executor,
            name: name.into(),
        }
    }

    /// Unit name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn systemctl(&self, verb: &str) -> SystemCommand {
        SystemCommand::new("systemctl").args([verb, self.name.as_str()])
    }

    /// Returns true if `systemctl is-active` prints `active`.
    pub async fn is_active(&self) -> bool {
        match self.executor.run(&self.systemctl("is-active")).await {
            Ok(out) => out.stdout_trimmed() == "active",
            Err(err) => {
                debug!(unit = %self.name, error = %err, "is-active failed");
                false
            }
        }
    }

    /// Returns true if the unit is enabled at boot.
    pub async fn is_enabled(&self) -> bool {
        match self.executor.run(&self.systemctl("is-enabled")).await {
            Ok(out) => out.stdout_trimmed() == "enabled",
            Err(_) => false,
        }
    }

    async fn verb(&self, verb: &str) -> Result<()> {
        self.executor.check(&self.systemctl(verb)).await?;
        info!(unit = %self.name, action = verb, "systemctl");
        Ok(())
    }

    /// `systemctl start`.
    ///
    /// # Errors
    ///
    /// Returns an error if systemctl fails.
    pub async fn start(&self) -> Result<()> {
        self.verb("start").await
    }

    /// `systemctl stop`.
    ///
    /// # Errors
    ///
    /// Returns an error if systemctl fails.
    pub async fn stop(&self) -> Result<()> {
        self.verb("stop").await
    }

    /// `systemctl restart`.
    ///
    /// # Errors
    ///
    /// Returns an error if systemctl fails.
    pub async fn restart(&self) -> Result<()> {
        self.verb("restart").await
    }

    /// `systemctl enable`.
    ///
    /// # Errors
    ///
    /// Returns an error if systemctl fails.
    pub async fn enable(&self) -> Result<()> {
        self.verb("enable").await
    }

    /// `systemctl disable`.
    ///
    /// # Errors
    ///
    /// Returns an error if systemctl fails.
    pub async fn disable(&self) -> Result<()> {
        self.verb("disable").await
    }

    /// Reads one property with `systemctl show -p <prop> --value`. Empty or
    /// `n/a` values are reported as `None`.
    pub async fn property(&self, property: &str) -> Option<String> {
        let cmd = SystemCommand::new("systemctl").args([
            "show",
            self.name.as_str(),
            "-p",
            property,
            "--value",
        ]);
        let value = self.executor.stdout(&cmd).await.ok()?;
        (!value.is_empty() && value != "n/a" && value != "0").then_some(value)
    }

    /// Last `lines` journal entries for the unit.
    ///
    /// # Errors
    ///
    /// Returns an error if journalctl fails.
    pub async fn journal(&self, lines: u32) -> Result<Vec<String>> {
        let cmd = SystemCommand::new("journalctl").args([
            "-u".to_string(),
            self.name.clone(),
            "-n".to_string(),
            lines.to_string(),
            "--no-pager".to_string(),
        ]);
        let out = self.executor.stdout(&cmd).await?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.starts_with("-- "))
            .map(str::to_string)
            .collect())
    }
}

/// `systemctl daemon-reload`.
///
/// # Errors
///
/// Returns an error if systemctl fails.
pub async fn daemon_reload(executor: &dyn Executor) -> Result<()> {
    executor
        .check(&SystemCommand::new("systemctl").arg("daemon-reload"))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_system::{CommandOutput, ScriptedExecutor};

    #[tokio::test]
    async fn is_active_reads_stdout() {
        let exec = ScriptedExecutor::new();
        exec.on("systemctl is-active wg-quick@wg_main", CommandOutput::ok("active\n"));
        exec.on("systemctl is-active wstunnel", CommandOutput::failed(3, "inactive"));
        assert!(Unit::new(&exec, "wg-quick@wg_main").is_active().await);
        assert!(!Unit::new(&exec, "wstunnel").is_active().await);
    }

    #[tokio::test]
    async fn property_filters_placeholders() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "systemctl show wg-quick@wg_main -p MainPID",
            CommandOutput::ok("0\n"),
        );
        exec.on(
            "systemctl show wg-quick@wg_main -p ActiveEnterTimestamp",
            CommandOutput::ok("Mon 2024-01-01 00:00:00 UTC\n"),
        );
        let unit = Unit::new(&exec, "wg-quick@wg_main");
        assert_eq!(unit.property("MainPID").await, None);
        assert_eq!(
            unit.property("ActiveEnterTimestamp").await.as_deref(),
            Some("Mon 2024-01-01 00:00:00 UTC")
        );
    }

    #[tokio::test]
    async fn journal_skips_markers() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "journalctl -u wg-quick@wg_main -n 3",
            CommandOutput::ok("-- Logs begin --\nline one\n\nline two\n"),
        );
        let logs = Unit::new(&exec, "wg-quick@wg_main").journal(3).await.expect("logs");
        assert_eq!(logs, vec!["line one", "line two"]);
    }

    #[tokio::test]
    async fn failed_restart_is_service_error() {
        let exec = ScriptedExecutor::new();
        exec.on("systemctl restart", CommandOutput::failed(1, "Job failed"));
        let err = Unit::new(&exec, "wg-quick@wg_main")
            .restart()
            .await
            .expect_err("fails");
        assert_eq!(err.code(), "SERVICE_OPERATION_FAILED");
    }
}
