//! WireGuard building blocks for the Phantom-WG control plane.
//!
//! This crate provides Curve25519 key types, the INI-style configuration
//! format understood by `wg` and `wg-quick`, and parsers for the tabular
//! output of `wg show`.

mod config;
pub mod error;
mod keys;
mod show;
mod types;

pub use config::{
    enhance_keepalive, parse_wg_config, InterfaceConfig, KeepaliveChange, PeerConfig,
    MULTIHOP_KEEPALIVE,
};
pub use error::{Result, WireGuardError};
pub use keys::{generate_keypair, PresharedKey, PrivateKey, PublicKey, KEY_SIZE};
pub use show::{parse_dump, parse_latest_handshakes, InterfaceDump, PeerDump};
pub use types::Endpoint;
