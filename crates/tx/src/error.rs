//! Transaction error taxonomy.

use thiserror::Error;

use crate::context::ContextError;

/// Errors produced by the transaction layer.
///
/// Caller errors returned from a unit of work travel through here as
/// [`TxError::Other`] (or any other variant the caller chose), and come
/// back either unchanged or compounded with a rollback failure.
#[derive(Debug, Error)]
pub enum TxError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    /// The handle was already committed or rolled back.
    #[error("transaction already resolved")]
    Closed,

    /// Backend timeout or lock contention, reclassified.
    #[error("transaction timeout: {0}")]
    Timeout(#[source] Box<TxError>),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] Box<TxError>),

    /// `cause` is the execution or commit failure; `rollback` is what went
    /// wrong while undoing it.
    #[error("{cause}; failed to rollback transaction: {rollback}")]
    Rollback {
        #[source]
        cause: Box<TxError>,
        rollback: Box<TxError>,
    },

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TxError {
    /// Wrap an arbitrary caller error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(err.into())
    }

    pub(crate) fn timeout(self) -> Self {
        if self.is_timeout() {
            return self;
        }
        Self::Timeout(Box::new(self))
    }

    /// True when the distinguished timeout kind appears anywhere in the
    /// wrapper chain.
    pub fn is_timeout(&self) -> bool {
        self.any_cause(&|err: &TxError| matches!(err, TxError::Timeout(_)))
    }

    /// The root failure behind a rollback-compounded error; `self` otherwise.
    pub fn cause(&self) -> &TxError {
        match self {
            TxError::Rollback { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// HTTP status an outer layer should report: 409 for timeouts so
    /// clients know to retry, 500 for everything else.
    pub fn status_code(&self) -> u16 {
        if self.is_timeout() {
            409
        } else {
            500
        }
    }

    /// Walk every wrapped error, including both halves of a rollback
    /// compound.
    pub(crate) fn any_cause(&self, pred: &dyn Fn(&TxError) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            TxError::Timeout(inner) | TxError::Commit(inner) => inner.any_cause(pred),
            TxError::Rollback { cause, rollback } => {
                cause.any_cause(pred) || rollback.any_cause(pred)
            }
            _ => false,
        }
    }

    /// Every `sqlx::Error` reachable from this error, including ones buried
    /// inside caller errors.
    pub(crate) fn any_sqlx(&self, pred: &dyn Fn(&sqlx::Error) -> bool) -> bool {
        self.any_cause(&|err: &TxError| match err {
            TxError::Database(db) => pred(db),
            TxError::Other(boxed) => {
                let mut next: Option<&(dyn std::error::Error + 'static)> = Some(boxed.as_ref());
                while let Some(e) = next {
                    if let Some(db) = e.downcast_ref::<sqlx::Error>() {
                        if pred(db) {
                            return true;
                        }
                    }
                    if let Some(tx) = e.downcast_ref::<TxError>() {
                        if tx.any_sqlx(pred) {
                            return true;
                        }
                    }
                    next = e.source();
                }
                false
            }
            _ => false,
        })
    }
}
