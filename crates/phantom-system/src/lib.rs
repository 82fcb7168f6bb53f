//! System seams for the Phantom-WG control plane.
//!
//! Everything that touches the outside world goes through one of the traits
//! in this crate so the higher layers can be exercised against fakes:
//!
//! - [`Executor`]: runs external programs (`wg`, `ip`, `iptables`, ...)
//! - [`Clock`]: wall-clock time
//! - [`RandomSource`]: entropy for keys and secrets
//! - [`Poll`]: bounded, cancellable waiting
//!
//! [`fs`] holds the atomic file helpers every state file is written with.

mod clock;
mod exec;
pub mod fs;
mod poll;
mod random;
mod scripted;

pub use clock::{Clock, ManualClock, SystemClock};
pub use exec::{
    CommandOutput, ExecError, ExecFuture, Executor, ExecutorExt, SystemCommand, SystemExecutor,
};
pub use poll::{Poll, PollError};
pub use random::{alphanumeric, random_bytes, OsRandom, RandomSource, SeededRandom};
pub use scripted::ScriptedExecutor;
pub use tokio_util::sync::CancellationToken;
