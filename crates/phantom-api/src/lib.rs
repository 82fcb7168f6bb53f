//! Action API for Phantom-WG.
//!
//! Every operation of every module is reachable through
//! [`Dispatcher::execute`], which takes a module name, an action name and a
//! JSON object of parameters and returns a [`Response`]:
//!
//! ```text
//! ("multihop", "enable_multihop", {"exit_name": "stockholm"})
//!        │
//!        ▼
//! Request::parse ──► Request::Multihop(EnableMultihop { .. })
//!        │
//!        ▼  action lock
//! MultihopModule::enable_multihop
//!        │
//!        ▼
//! Response { success, data, error, code, metadata }
//! ```
//!
//! Actions run one at a time; the lock is shared by every clone of a
//! [`Dispatcher`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dispatcher;
pub mod params;
pub mod request;
pub mod response;

pub use dispatcher::Dispatcher;
pub use request::{CoreRequest, DnsRequest, GhostRequest, Module, MultihopRequest, Request, RequestError};
pub use response::{Metadata, Response, API_VERSION};
