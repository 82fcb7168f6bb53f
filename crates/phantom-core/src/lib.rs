//! Core of the Phantom-WG control plane.
//!
//! Owns the state shared by every module: `phantom.json`, the client and
//! IP allocation store, and the main WireGuard interface. On top of that it
//! implements the `core` module actions (client lifecycle, service
//! supervision, tweaks, subnet migration) and the `dns` module.
//!
//! Every handler takes a [`Context`], which carries the filesystem layout
//! and the injected executor, clock and randomness. Enable the `testing`
//! feature for a sandboxed context backed by a scripted executor.

pub mod allocation;
mod clients;
pub mod config;
mod context;
mod dns;
pub mod error;
pub mod features;
pub mod firewall;
mod interface;
mod network;
mod service;
pub mod settings;
pub mod store;
pub mod systemd;
mod tweaks;
pub mod validate;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clients::{
    AddClientResult, ClientHandler, ClientInfo, ClientList, ClientStatus, ConnectionInfo,
    ExportedClient, GhostInfo, LatestClients, Pagination, RemoveClientResult, DEFAULT_LATEST,
    DEFAULT_PER_PAGE, ONLINE_THRESHOLD_SECS,
};
pub use config::{PhantomConfig, DEFAULT_INTERFACE, DEFAULT_PORT};
pub use context::Context;
pub use dns::{
    DnsChange, DnsHealth, DnsManager, DnsServers, DnsStatus, DnsTestReport, DomainCheck,
    ServerHealth, ServerProbe, DEFAULT_TEST_DOMAIN,
};
pub use error::{PhantomError, Result};
pub use features::{GhostChanges, GhostState, GHOST_PORT};
pub use interface::{host_addresses, host_networks, MainInterface};
pub use network::{
    parse_subnet, Blockers, Check, NetworkMigrator, SubnetChange, SubnetInfo, SubnetValidation,
    UplinkInfo, ValidationDetails,
};
pub use service::{
    FirewallStatus, RestartResult, ServerStatus, ServiceLogs, ServiceMonitor, DEFAULT_LOG_LINES,
    MAX_LOG_LINES,
};
pub use settings::{Paths, Settings, Timeouts};
pub use store::{ClientRecord, DataStore};
pub use tweaks::{TweakManager, TweakSettings, TweakUpdate, RESTART_AFTER_CLIENT_CHANGE};
