//! Multihop egress for Phantom-WG.
//!
//! Client traffic leaves through a second WireGuard tunnel (`wg_vpn`) to an
//! imported upstream exit, while traffic between peers stays on the main
//! interface. Routing is split with policy rules on the source subnet:
//!
//! ```text
//! 100:  from <subnet> to <subnet> lookup main
//! 200:  from <subnet> lookup multihop      (default dev wg_vpn)
//! ```
//!
//! A monitor service ([`monitor::Monitor`]) watches the exit handshake and
//! writes a session log that [`MultihopModule::get_session_log`] reads back.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod exits;
pub mod monitor;
mod module;
pub mod routing;
pub mod session;
pub mod tunnel;

pub use exits::{ExitInfo, ExitMetadata, ExitStore, ImportResult};
pub use module::{
    EndpointProbe, ExitList, HandshakeProbe, MultihopDisabled, MultihopEnabled, MultihopModule,
    MultihopStatus, RemoveResult, ResetResult, SessionLogView, TunnelProbe, VpnInterface,
    VpnTestReport, VpnTests,
};
pub use monitor::{Monitor, MonitorStatus, MONITOR_UNIT};
pub use session::Level;
pub use tunnel::VPN_INTERFACE;
