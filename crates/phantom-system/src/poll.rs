//! Bounded waiting for external state to converge.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`Poll`] stopped without the predicate holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    /// The deadline passed.
    #[error("condition not met within {0:?}")]
    TimedOut(Duration),
    /// The cancellation token fired.
    #[error("wait cancelled")]
    Cancelled,
}

/// Repeatedly evaluates a predicate until it holds, a deadline passes or
/// the operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    deadline: Duration,
    interval: Duration,
}

impl Poll {
    /// Creates a poll with the total wait and the pause between attempts.
    #[must_use]
    pub const fn new(deadline: Duration, interval: Duration) -> Self {
        Self { deadline, interval }
    }

    /// Total time allowed.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Waits for `predicate` to return true. It is evaluated once
    /// immediately and then after every interval; the last attempt happens
    /// at or just after the deadline.
    ///
    /// Returns the number of attempts made.
    ///
    /// # Errors
    ///
    /// [`PollError::TimedOut`] or [`PollError::Cancelled`].
    pub async fn until<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut predicate: F,
    ) -> Result<u32, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            attempts += 1;
            if predicate().await {
                return Ok(attempts);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                return Err(PollError::TimedOut(self.deadline));
            }
            let pause = self.interval.min(self.deadline - elapsed);
            tokio::select! {
                () = cancel.cancelled() => return Err(PollError::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}
