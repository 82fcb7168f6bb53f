//! # phantom-cli
//!
//! The `phantom` binary.
//!
//! - `phantom exec <module> <action> [key=value...]` runs one action and
//!   prints its JSON response
//! - `phantom modules` and `phantom health` describe the API
//! - `phantom monitor` is the multihop handshake monitor run by systemd
//!
//! Exit codes: 0 on success, 1 when an action fails, 2 for an invalid
//! invocation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;

pub use cli::{Cli, Commands, LogFormat};
pub use commands::{parse_params, run};
pub use error::{CliError, Outcome};
