//! Cooperative cancellation for a single run.
//!
//! A [`CancellationToken`] is handed to every step of a run. Flow code calls
//! [`CancellationToken::check`] before and after remote calls and sleeps only
//! through [`CancellationToken::wait`], so a stop request aborts a long
//! polling loop at the next timer tick instead of after the full interval.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken as Signal;

/// Raised once the run's token has been signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Run cancelled")]
pub struct Cancelled;

/// Single-use cancellation handle shared by everything inside one run.
///
/// Cloning is cheap; all clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    signal: Signal,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Fail with [`Cancelled`] if the token has been signalled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.signal.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, failing early if the token is signalled.
    ///
    /// The sleep future is dropped as soon as the signal fires, so no timer
    /// outlives a cancelled wait.
    pub async fn wait(&self, duration: Duration) -> Result<(), Cancelled> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Resolves once the token is signalled.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await;
    }
}
