//! `phantom` binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;

use phantom_cli::{logging, Cli, CliError, Outcome};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match start(&cli) {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn start(cli: &Cli) -> anyhow::Result<Outcome> {
    logging::init(cli.log_format)?;
    let runtime = tokio::runtime::Runtime::new()?;
    let mut stdout = io::stdout().lock();
    Ok(runtime.block_on(phantom_cli::run(cli, &mut stdout))?)
}
