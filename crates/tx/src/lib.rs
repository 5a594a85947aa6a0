//! `tx` crate: transactional behaviour for arbitrary repository types.
//!
//! A repository stores a coordinator ([`PgRepositoryTxer`] or
//! [`SqliteRepositoryTxer`]) and delegates to it to:
//! 1. start a transaction and obtain a repository *copy* bound to it,
//! 2. run a function inside a transaction with automatic commit/rollback,
//! 3. reuse an already-open transaction for nested calls (no savepoints).
//!
//! The root (non-transactional) repository may be shared across tasks as
//! long as its connection source is a pool.  A repository bound to a
//! transaction is tied to a single connection and must stay inside the
//! unit of work that created it.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod context;
pub mod error;
pub mod executor;
pub mod mock;
pub mod pg;
pub mod shared;
pub mod sqlite;

pub use context::{Context, ContextError};
pub use error::TxError;
pub use executor::run;
pub use pg::{classify_pg_timeout, PgRepositoryTxer, PgRepositoryTxerConfig, PgTx, PgTxer};
pub use shared::SharedTx;
pub use sqlite::{
    classify_sqlite_timeout, SqliteRepositoryTxer, SqliteRepositoryTxerConfig, SqliteTx,
    SqliteTxWrapper, SqliteTxer,
};

/// Upper bound and fallback for a coordinator's transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Clamp a configured timeout into `(0, DEFAULT_TIMEOUT]`.
pub fn effective_timeout(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(t) if !t.is_zero() && t <= DEFAULT_TIMEOUT => t,
        _ => DEFAULT_TIMEOUT,
    }
}

/// Whole milliseconds for a backend timeout setting, rounded up so a
/// sub-millisecond timeout never becomes `0` (which both backends read as
/// "no limit").
pub(crate) fn timeout_millis(timeout: Duration) -> u128 {
    timeout.as_nanos().div_ceil(1_000_000)
}

/// One open transaction, independent of backend.
#[async_trait]
pub trait Tx: Send + Sync + 'static {
    async fn commit(&self, ctx: &Context) -> Result<(), TxError>;

    async fn rollback(&self, ctx: &Context) -> Result<(), TxError>;

    /// Lets a coordinator recover its backend's concrete handle.
    fn as_any(&self) -> &dyn Any;
}

/// Shared pointer to an open transaction as passed to units of work.
pub type TxHandle = Arc<dyn Tx>;

/// Capability of a fully transactional repository type `R`.
///
/// ```ignore
/// repo.begin_tx_func(&ctx, |ctx, _tx, repo| async move {
///     repo.create(&ctx, "title", "body").await?;
///     Ok(())
/// })
/// .await?;
/// ```
pub trait Repository<R>: Sized {
    /// A copy of the repository bound to `tx`.  Inside an ambient
    /// transaction the repository is returned unchanged.
    fn with_tx(&self, tx: &TxHandle) -> R;

    /// Run `f` inside a transaction, committing when it returns `Ok`,
    /// rolling back on `Err` or panic.  Nested calls reuse the ambient
    /// transaction.  Timeouts surface as [`TxError::Timeout`].
    fn begin_tx_func<F, Fut>(
        &self,
        ctx: &Context,
        f: F,
    ) -> impl Future<Output = Result<(), TxError>> + Send
    where
        F: FnOnce(Context, TxHandle, R) -> Fut + Send,
        Fut: Future<Output = Result<(), TxError>> + Send;
}
