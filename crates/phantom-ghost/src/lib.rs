//! Ghost mode for Phantom-WG.
//!
//! Hides WireGuard inside TLS WebSockets on port 443. A wstunnel server
//! terminates TLS with a certificate for the operator's domain and forwards
//! upgrade requests carrying the secret path prefix to the local WireGuard
//! port, which is closed to everything but loopback.
//!
//! ```rust,ignore
//! use phantom_ghost::GhostModule;
//!
//! let ghost = GhostModule::new(ctx);
//! let enabled = ghost.enable("vpn.example.com").await?;
//! println!("{}", enabled.connection_command);
//! ```
//!
//! Setup records each change in `ghost-state.json` as it is made; a failed
//! step undoes everything recorded so far.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod certificate;
pub mod filter;
mod module;
pub mod resolve;
pub mod tunnel;

pub use module::{
    GhostDisabled, GhostEnabled, GhostModule, GhostServices, GhostStatus, SECRET_LEN,
};
