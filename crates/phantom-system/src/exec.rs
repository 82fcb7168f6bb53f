//! External program execution.
//!
//! Commands are always spawned directly with an argument vector, never
//! through `sh -c`, so values taken from requests cannot be interpreted by a
//! shell.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::{debug, trace};

/// Characters rejected in program names and arguments.
const FORBIDDEN_CHARS: &[char] = &['\0', '\n', '\r'];

/// Default per-command timeout of [`SystemExecutor`].
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from running an external program.
#[derive(Debug, Error)]
pub enum ExecError {
    /// An argument contained a forbidden control character.
    #[error("invalid argument for {program}: contains control character")]
    InvalidArgument {
        /// Program the argument was meant for.
        program: String,
    },

    /// The program could not be started.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish in time.
    #[error("command timed out after {seconds}s: {command}")]
    Timeout {
        /// Rendered command line.
        command: String,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// The program exited unsuccessfully.
    #[error("command failed with exit code {exit_code}: {command}: {stderr}")]
    NonZeroExit {
        /// Rendered command line.
        command: String,
        /// Exit code (-1 when killed by a signal).
        exit_code: i32,
        /// Trimmed standard error.
        stderr: String,
    },
}

/// A program invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl SystemCommand {
    /// Creates a command for the given program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feeds the given text to standard input.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments in order.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Standard input, if any.
    #[must_use]
    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    fn validate(&self) -> Result<(), ExecError> {
        let bad = std::iter::once(&self.program)
            .chain(&self.args)
            .any(|a| a.contains(FORBIDDEN_CHARS));
        if bad {
            return Err(ExecError::InvalidArgument {
                program: self.program.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when terminated by a signal.
    pub exit_code: i32,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the exit code is 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with surrounding whitespace removed.
    #[must_use]
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Boxed future returned by executor methods.
pub type ExecFuture<'a, T = CommandOutput> =
    Pin<Box<dyn Future<Output = Result<T, ExecError>> + Send + 'a>>;

/// Runs external programs.
///
/// A non-zero exit is not an error at this level; callers decide with
/// [`ExecutorExt`] whether they need success.
pub trait Executor: Send + Sync {
    /// Runs the command to completion and captures its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be started or times out.
    fn run<'a>(&'a self, command: &'a SystemCommand) -> ExecFuture<'a>;
}

/// Convenience operations on top of [`Executor`].
pub trait ExecutorExt: Executor {
    /// Runs the command and requires a zero exit code.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::NonZeroExit`] on failure.
    fn check<'a>(&'a self, command: &'a SystemCommand) -> ExecFuture<'a> {
        Box::pin(async move {
            let output = self.run(command).await?;
            if output.success() {
                Ok(output)
            } else {
                Err(ExecError::NonZeroExit {
                    command: command.to_string(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                })
            }
        })
    }

    /// Runs the command and reports whether it succeeded. Spawn failures
    /// count as failure.
    fn succeeds<'a>(
        &'a self,
        command: &'a SystemCommand,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.run(command).await {
                Ok(output) => output.success(),
                Err(err) => {
                    debug!(command = %command, error = %err, "command could not run");
                    false
                }
            }
        })
    }

    /// Runs the command and returns trimmed stdout on success.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::NonZeroExit`] on failure.
    fn stdout<'a>(&'a self, command: &'a SystemCommand) -> ExecFuture<'a, String> {
        Box::pin(async move {
            let output = self.check(command).await?;
            Ok(output.stdout.trim().to_string())
        })
    }
}

impl<T: Executor + ?Sized> ExecutorExt for T {}

/// Executor backed by `tokio::process`.
#[derive(Clone, Debug)]
pub struct SystemExecutor {
    timeout: Duration,
}

impl SystemExecutor {
    /// Creates an executor with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn spawn(command: &SystemCommand) -> Result<CommandOutput, ExecError> {
        let spawn_err = |source| ExecError::Spawn {
            program: command.program.clone(),
            source,
        };

        let mut cmd = TokioCommand::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (command.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(spawn_err)?;
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_err)?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SystemExecutor {
    fn run<'a>(&'a self, command: &'a SystemCommand) -> ExecFuture<'a> {
        Box::pin(async move {
            command.validate()?;
            trace!(command = %command, "executing");
            let output = tokio::time::timeout(self.timeout, Self::spawn(command))
                .await
                .map_err(|_| ExecError::Timeout {
                    command: command.to_string(),
                    seconds: self.timeout.as_secs(),
                })??;
            debug!(command = %command, exit_code = output.exit_code, "command finished");
            Ok(output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display_joins_args() {
        let cmd = SystemCommand::new("ip").args(["link", "show", "wg_main"]);
        assert_eq!(cmd.to_string(), "ip link show wg_main");
        assert_eq!(cmd.arguments().len(), 3);
    }

    #[test]
    fn control_characters_rejected() {
        let cmd = SystemCommand::new("wg").arg("set\nwg0");
        assert!(matches!(
            cmd.validate(),
            Err(ExecError::InvalidArgument { .. })
        ));
        assert!(SystemCommand::new("wg").arg("show").validate().is_ok());
    }

    #[test]
    fn output_helpers() {
        assert!(CommandOutput::ok("x").success());
        let failed = CommandOutput::failed(3, "boom");
        assert!(!failed.success());
        assert_eq!(failed.stderr, "boom");
        assert_eq!(CommandOutput::ok("  active\n").stdout_trimmed(), "active");
    }

    #[tokio::test]
    async fn system_executor_runs_true_and_false() {
        let exec = SystemExecutor::new();
        assert!(exec.succeeds(&SystemCommand::new("true")).await);
        assert!(!exec.succeeds(&SystemCommand::new("false")).await);
    }

    #[tokio::test]
    async fn system_executor_feeds_stdin() {
        let exec = SystemExecutor::new();
        let out = exec
            .stdout(&SystemCommand::new("cat").stdin("psk-material"))
            .await
            .expect("cat runs");
        assert_eq!(out, "psk-material");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let exec = SystemExecutor::new();
        let err = exec
            .run(&SystemCommand::new("/nonexistent/phantom-binary"))
            .await
            .expect_err("spawn fails");
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn check_maps_nonzero_exit() {
        let exec = SystemExecutor::new();
        let err = exec
            .check(&SystemCommand::new("false"))
            .await
            .expect_err("false fails");
        assert!(matches!(err, ExecError::NonZeroExit { exit_code: 1, .. }));
    }
}
