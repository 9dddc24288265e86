//! # Caller Context
//!
//! Cancellation and deadline carried into `publish` and `subscribe`.
//!
//! A [`Context`] is cheap to clone. Derived contexts inherit every
//! cancellation signal of their parent and the earlier of the two deadlines.
//!
//! ```rust,ignore
//! let (ctx, cancel) = Context::background().with_cancel();
//! let ctx = ctx.with_timeout(Duration::from_secs(2));
//! broker.publish(&ctx, "user.created", &user).await?;
//! cancel.cancel();
//! ```

use crate::error::{BrokerError, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation signals and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Cancels every context derived from the one that created it.
///
/// Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signal cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context with its own cancellation handle.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut child = self.clone();
        child.signals.push(receiver);
        (
            child,
            CancelHandle {
                sender: Arc::new(sender),
            },
        )
    }

    /// Derive a child context expiring after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context expiring at `deadline` (or the parent's, if earlier).
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<BrokerError> {
        if self.signals.iter().any(|signal| *signal.borrow()) {
            return Some(BrokerError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(BrokerError::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Err` if the context is already done.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for [`Context::background`].
    pub async fn done(&self) -> BrokerError {
        let cancelled = async {
            let mut waiters: FuturesUnordered<_> =
                self.signals.iter().cloned().map(wait_cancelled).collect();
            if waiters.next().await.is_none() {
                pending::<()>().await;
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => BrokerError::Cancelled,
            _ = expired => BrokerError::DeadlineExceeded,
        }
    }

    /// Race `fut` against this context.
    ///
    /// The future is dropped, not awaited, when the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

async fn wait_cancelled(mut signal: watch::Receiver<bool>) {
    // A dropped handle can never cancel.
    if signal.wait_for(|cancelled| *cancelled).await.is_err() {
        pending::<()>().await;
    }
}
