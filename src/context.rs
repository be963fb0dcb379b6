//! Deadlines and cancellation for blocking gateway operations.
//!
//! Every call that can wait on a process, a socket or a timer takes a
//! [`Context`]. Expiry is reported as [`GatewayError::DeadlineExceeded`] and
//! explicit cancellation as [`GatewayError::Cancelled`], so callers can tell
//! either apart from an upstream failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Derives a context that expires at the earlier of the parent deadline and
    /// `now + timeout`. Cancelling the parent cancels the child, not vice versa.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is finished, if it is.
    pub fn err(&self) -> Option<GatewayError> {
        if self.token.is_cancelled() {
            return Some(GatewayError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(GatewayError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> GatewayError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => GatewayError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => GatewayError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                GatewayError::Cancelled
            }
        }
    }

    /// Drives `fut` until it completes or the context finishes, whichever comes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
