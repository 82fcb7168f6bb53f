//! Subcommand implementations.

use std::io::Write;

use phantom_api::{Dispatcher, Response};
use phantom_core::Context;
use phantom_multihop::{Level, Monitor};
use phantom_system::CancellationToken;
use serde_json::{Map, Value};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Outcome};

/// Turns `key=value` arguments into a parameter object. Values that parse
/// as JSON are kept as JSON, anything else becomes a string.
///
/// # Errors
///
/// [`CliError::InvalidArgument`] for a pair without `=` or with an empty
/// key.
pub fn parse_params(pairs: &[String]) -> Result<Map<String, Value>, CliError> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| CliError::InvalidArgument(format!("expected KEY=VALUE, got '{pair}'")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::InvalidArgument(format!("empty key in '{pair}'")));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

/// Runs the parsed command, writing responses to `out`.
///
/// # Errors
///
/// Returns an error for malformed arguments, output failures, or a
/// monitor that cannot read its state.
pub async fn run<W: Write>(cli: &Cli, out: &mut W) -> Result<Outcome, CliError> {
    let ctx = Context::system(cli.settings());
    match &cli.command {
        Commands::Exec {
            module,
            action,
            params,
        } => {
            let params = parse_params(params)?;
            let response = execute(ctx, cancel_on_shutdown(), module, action, params).await;
            print(out, &response, cli.compact)?;
            Ok(outcome(&response))
        }
        Commands::Modules => {
            print(out, &Dispatcher::new(ctx).list_modules(), cli.compact)?;
            Ok(Outcome::Success)
        }
        Commands::Health => {
            print(out, &Dispatcher::new(ctx).health(), cli.compact)?;
            Ok(Outcome::Success)
        }
        Commands::Monitor { level } => {
            monitor(ctx, *level).await?;
            Ok(Outcome::Success)
        }
    }
}

/// Runs one action with `cancel` as its cancellation token. A cancelled
/// action still finishes its rollback before the response comes back.
pub async fn execute(
    ctx: Context,
    cancel: CancellationToken,
    module: &str,
    action: &str,
    params: Map<String, Value>,
) -> Response {
    Dispatcher::new(ctx.with_cancellation(cancel))
        .execute(module, action, params)
        .await
}

/// Token fired by the first SIGINT or SIGTERM. Installing the handlers also
/// stops either signal from killing the process outright.
fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, cancelling");
        trigger.cancel();
    });
    cancel
}

fn outcome(response: &Response) -> Outcome {
    match response.code {
        None if response.success => Outcome::Success,
        Some("UNKNOWN_ACTION") => Outcome::Invalid,
        _ => Outcome::Failed,
    }
}

fn print<W: Write>(out: &mut W, response: &Response, compact: bool) -> Result<(), CliError> {
    if compact {
        serde_json::to_writer(&mut *out, response)?;
    } else {
        serde_json::to_writer_pretty(&mut *out, response)?;
    }
    writeln!(out)?;
    Ok(())
}

async fn monitor(ctx: Context, level: Level) -> Result<(), CliError> {
    Monitor::new(ctx.with_cancellation(cancel_on_shutdown()), level)
        .run()
        .await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
