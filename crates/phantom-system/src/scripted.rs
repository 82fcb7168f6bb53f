//! In-memory [`Executor`] for tests.
//!
//! Responses are keyed by command-line prefix. Later registrations win, so a
//! test can start from a shared baseline and override single commands.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::exec::{CommandOutput, ExecFuture, Executor, SystemCommand};

type Responder = Arc<dyn Fn(&SystemCommand) -> CommandOutput + Send + Sync>;

enum Reply {
    Fixed(CommandOutput),
    Sequence(Mutex<VecDeque<CommandOutput>>),
    Dynamic(Responder),
}

struct Rule {
    prefix: String,
    reply: Reply,
}

/// Executor that answers from a script and records every call.
///
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<SystemCommand>>,
}

impl ScriptedExecutor {
    /// Creates an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, prefix: &str, reply: Reply) -> &Self {
        self.rules.lock().push(Rule {
            prefix: prefix.to_string(),
            reply,
        });
        self
    }

    /// Answers commands starting with `prefix` with a fixed output.
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.push(prefix, Reply::Fixed(output))
    }

    /// Answers with successive outputs; the last one repeats.
    pub fn on_sequence(&self, prefix: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.push(prefix, Reply::Sequence(Mutex::new(outputs.into())))
    }

    /// Answers by calling `f` with the command.
    pub fn on_with<F>(&self, prefix: &str, f: F) -> &Self
    where
        F: Fn(&SystemCommand) -> CommandOutput + Send + Sync + 'static,
    {
        self.push(prefix, Reply::Dynamic(Arc::new(f)))
    }

    /// Every command line run so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(ToString::to_string).collect()
    }

    /// Every command run so far, with stdin.
    #[must_use]
    pub fn commands(&self) -> Vec<SystemCommand> {
        self.calls.lock().clone()
    }

    /// Command lines starting with `prefix`.
    #[must_use]
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Returns true if any command line started with `prefix`.
    #[must_use]
    pub fn was_called(&self, prefix: &str) -> bool {
        !self.calls_matching(prefix).is_empty()
    }

    /// Forgets recorded calls, keeping the script.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn answer(&self, command: &SystemCommand) -> CommandOutput {
        let line = command.to_string();
        let dynamic = {
            let rules = self.rules.lock();
            let Some(rule) = rules.iter().rev().find(|r| line.starts_with(&r.prefix)) else {
                return CommandOutput::default();
            };
            match &rule.reply {
                Reply::Fixed(out) => return out.clone(),
                Reply::Sequence(queue) => {
                    let mut queue = queue.lock();
                    return if queue.len() > 1 {
                        queue.pop_front().unwrap_or_default()
                    } else {
                        queue.front().cloned().unwrap_or_default()
                    };
                }
                Reply::Dynamic(f) => Arc::clone(f),
            }
        };
        // Called outside the lock so responders may inspect the executor.
        dynamic(command)
    }
}

impl Executor for ScriptedExecutor {
    fn run<'a>(&'a self, command: &'a SystemCommand) -> ExecFuture<'a> {
        Box::pin(async move {
            self.calls.lock().push(command.clone());
            Ok(self.answer(command))
        })
    }
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor")
            .field("rules", &self.rules.lock().len())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecutorExt;

    #[tokio::test]
    async fn unmatched_commands_succeed() {
        let exec = ScriptedExecutor::new();
        let out = exec
            .run(&SystemCommand::new("wg").arg("show"))
            .await
            .expect("runs");
        assert!(out.success());
        assert_eq!(exec.calls(), vec!["wg show".to_string()]);
    }

    #[tokio::test]
    async fn later_rules_override_earlier() {
        let exec = ScriptedExecutor::new();
        exec.on("systemctl is-active", CommandOutput::ok("inactive"));
        exec.on("systemctl is-active wg", CommandOutput::ok("active"));

        let wg = SystemCommand::new("systemctl").args(["is-active", "wg-quick@wg_main"]);
        let other = SystemCommand::new("systemctl").args(["is-active", "nginx"]);
        assert_eq!(exec.stdout(&wg).await.expect("wg"), "active");
        assert_eq!(exec.stdout(&other).await.expect("other"), "inactive");
    }

    #[tokio::test]
    async fn sequence_repeats_last() {
        let exec = ScriptedExecutor::new();
        exec.on_sequence(
            "probe",
            vec![CommandOutput::failed(1, ""), CommandOutput::ok("up")],
        );
        let cmd = SystemCommand::new("probe");
        assert!(!exec.succeeds(&cmd).await);
        assert!(exec.succeeds(&cmd).await);
        assert!(exec.succeeds(&cmd).await);
    }

    #[tokio::test]
    async fn dynamic_sees_stdin() {
        let exec = ScriptedExecutor::new();
        exec.on_with("cat", |cmd| {
            CommandOutput::ok(cmd.input().unwrap_or_default().to_uppercase())
        });
        let out = exec
            .stdout(&SystemCommand::new("cat").stdin("abc"))
            .await
            .expect("cat");
        assert_eq!(out, "ABC");
        assert!(exec.was_called("cat"));
    }
}
