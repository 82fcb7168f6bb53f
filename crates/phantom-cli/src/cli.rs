//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand, ValueEnum};
use phantom_core::settings::DEFAULT_INSTALL_DIR;
use phantom_core::{Paths, Settings};
use phantom_multihop::Level;

/// Phantom-WG control plane.
#[derive(Parser, Debug, Clone)]
#[command(name = "phantom")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Installation root holding config, data, logs and exits.
    #[arg(long, env = "PHANTOM_INSTALL_DIR", default_value = DEFAULT_INSTALL_DIR)]
    pub install_dir: PathBuf,

    /// Directory of wg-quick interface files.
    #[arg(long, env = "PHANTOM_WG_DIR")]
    pub wg_dir: Option<PathBuf>,

    /// Issue self-signed certificates instead of using ACME.
    #[arg(long, env = "PHANTOM_TEST", value_parser = FalseyValueParser::new())]
    pub test_mode: bool,

    /// Diagnostic log format on stderr.
    #[arg(long, env = "PHANTOM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print responses on one line.
    #[arg(long)]
    pub compact: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Diagnostic log formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a module action.
    ///
    /// Parameters are `key=value` pairs. A value that parses as JSON is
    /// passed as JSON (`confirm=true`, `lines=20`,
    /// `servers='["1.1.1.1","8.8.8.8"]'`); anything else is a string.
    Exec {
        /// Module name: core, dns, ghost or multihop.
        module: String,
        /// Action name.
        action: String,
        /// Parameters as key=value.
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// List modules and their actions.
    Modules,

    /// Report API health.
    Health,

    /// Watch the multihop exit handshake until multihop is disabled.
    Monitor {
        /// Lowest level written to the session log.
        #[arg(long, env = "MULTIHOP_LOG_LEVEL", default_value = "INFO", value_parser = parse_level)]
        level: Level,
    },
}

fn parse_level(value: &str) -> Result<Level, String> {
    value.parse()
}

impl Cli {
    /// Settings for the chosen install root.
    #[must_use]
    pub fn settings(&self) -> Settings {
        let mut paths = Paths::system(&self.install_dir);
        if let Some(dir) = &self.wg_dir {
            paths.wireguard_dir.clone_from(dir);
        }
        let mut settings = Settings::new(paths);
        settings.test_mode = self.test_mode;
        settings.monitor_exec = self.monitor_command();
        settings
    }

    /// Command line systemd runs for the monitor: this binary, pointed at
    /// the same install root.
    fn monitor_command(&self) -> String {
        let exe = std::env::current_exe()
            .map_or_else(|_| "/usr/local/bin/phantom".to_string(), |p| p.display().to_string());
        let mut command = format!("{exe} --install-dir {}", self.install_dir.display());
        if let Some(dir) = &self.wg_dir {
            command.push_str(&format!(" --wg-dir {}", dir.display()));
        }
        command.push_str(" monitor");
        command
    }
}
