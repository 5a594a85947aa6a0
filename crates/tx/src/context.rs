//! Request-scoped deadline and cancellation.
//!
//! A [`Context`] travels with a unit of work through the coordinators and
//! into repository calls.  Cloning is cheap: clones and contexts derived
//! via [`Context::with_timeout`] share one cancellation state, so
//! cancelling any of them cancels all of them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Deadline + cancellation carrier.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Arc<CancelState>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never done unless cancelled.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: Arc::new(CancelState::default()),
        }
    }

    /// Derive a context that expires after `timeout`.
    ///
    /// The derived deadline never extends the parent's.  A timeout too
    /// large to represent as an instant leaves the parent's deadline as is.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(candidate)) => Some(existing.min(candidate)),
            (existing, candidate) => existing.or(candidate),
        };
        Self {
            deadline,
            cancel: Arc::clone(&self.cancel),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every context sharing its state.
    pub fn cancel(&self) {
        self.cancel.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify.notify_waiters();
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.cancelled.load(Ordering::SeqCst) {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline elapses.
    pub async fn done(&self) -> ContextError {
        let cancelled = async {
            loop {
                let notified = self.cancel.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.cancel.cancelled.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = cancelled => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                ContextError::Cancelled
            }
        }
    }

    /// Drive `fut` until it completes or the context is done, whichever
    /// comes first.  On the losing branch `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
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
}
