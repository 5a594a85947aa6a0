//! SQLite coordinator backed by an sqlx pool.
//!
//! SQLite allows a single writer, so besides running the whole transaction
//! under a context deadline the coordinator sets `PRAGMA busy_timeout` to
//! the same duration.  Lock contention then surfaces as `SQLITE_BUSY`
//! instead of an indefinite wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, trace, warn};

use crate::shared::SharedTx;
use crate::{
    effective_timeout, executor, timeout_millis, Context, ContextError, Tx, TxError, TxHandle,
};

/// Primary result code for a busy database file.
pub const SQLITE_BUSY: i32 = 5;

/// Primary result code for a locked table.
pub const SQLITE_LOCKED: i32 = 6;

/// Anything that can begin a SQLite transaction.  Implemented for
/// [`SqlitePool`].
#[async_trait]
pub trait SqliteTxer: Send + Sync {
    async fn begin_tx(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error>;
}

#[async_trait]
impl SqliteTxer for SqlitePool {
    async fn begin_tx(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.begin().await
    }
}

/// The native SQLite transaction handed to binders.
pub type SqliteTx = SharedTx<Sqlite>;

/// Adapts a [`SqliteTx`] to [`Tx`].
///
/// The commit runs on its own task and is raced against the context.  If
/// the context finishes first the task is aborted, which drops the native
/// transaction and lets sqlx roll it back, and the context error is
/// returned without waiting for the commit.
#[derive(Debug, Clone)]
pub struct SqliteTxWrapper {
    base: SqliteTx,
}

impl SqliteTxWrapper {
    pub fn new(tx: SqliteTx) -> Self {
        Self { base: tx }
    }

    /// The wrapped transaction, for binders that rebind query targets.
    pub fn native(&self) -> &SqliteTx {
        &self.base
    }
}

#[async_trait]
impl Tx for SqliteTxWrapper {
    async fn commit(&self, ctx: &Context) -> Result<(), TxError> {
        let tx = self.base.take().await?;

        if let Some(err) = ctx.err() {
            // Already closed is fine here.
            let _ = tx.rollback().await;
            return Err(err.into());
        }

        let mut commit = tokio::spawn(tx.commit());
        tokio::select! {
            res = &mut commit => match res {
                Ok(res) => res.map_err(TxError::from),
                Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
                Err(join) => Err(TxError::other(join)),
            },
            err = ctx.done() => {
                commit.abort();
                tokio::spawn(async move {
                    match commit.await {
                        Ok(Ok(())) => warn!("sqlite commit finished after its context was done"),
                        Ok(Err(err)) => debug!(error = %err, "sqlite commit failed after its context was done"),
                        Err(_) => debug!("sqlite commit abandoned; transaction rolled back on drop"),
                    }
                });
                Err(err.into())
            }
        }
    }

    async fn rollback(&self, _ctx: &Context) -> Result<(), TxError> {
        let tx = self.base.take().await?;
        tx.rollback().await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

type SqliteWithTxFn<R> = Arc<dyn Fn(R, SqliteRepositoryTxer<R>, SqliteTx) -> R + Send + Sync>;

/// Construction parameters for [`SqliteRepositoryTxer`].
pub struct SqliteRepositoryTxerConfig<R> {
    /// Maximum duration of a whole transaction, applied both as a context
    /// deadline and as `PRAGMA busy_timeout`.  Zero or anything above
    /// [`crate::DEFAULT_TIMEOUT`] falls back to the default.
    pub timeout: Option<Duration>,

    /// Binder producing a transaction-bound copy of the repository; see
    /// [`crate::PgRepositoryTxerConfig`] for the contract.
    with_tx_fn: SqliteWithTxFn<R>,
}

impl<R> SqliteRepositoryTxerConfig<R> {
    pub fn new<F>(with_tx_fn: F) -> Self
    where
        F: Fn(R, SqliteRepositoryTxer<R>, SqliteTx) -> R + Send + Sync + 'static,
    {
        Self {
            timeout: None,
            with_tx_fn: Arc::new(with_tx_fn),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Adds transactional behaviour to repository type `R` over SQLite.
///
/// Same sharing rules as [`crate::PgRepositoryTxer`]: the root may be
/// shared, a copy with an active transaction may not.
pub struct SqliteRepositoryTxer<R> {
    timeout: Duration,
    with_tx_fn: SqliteWithTxFn<R>,
    txer: Arc<dyn SqliteTxer>,
    txn: Option<TxHandle>,
}

impl<R> Clone for SqliteRepositoryTxer<R> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            with_tx_fn: Arc::clone(&self.with_tx_fn),
            txer: Arc::clone(&self.txer),
            txn: self.txn.clone(),
        }
    }
}

impl<R> std::fmt::Debug for SqliteRepositoryTxer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepositoryTxer")
            .field("timeout", &self.timeout)
            .field("in_tx", &self.in_tx())
            .finish()
    }
}

impl<R> SqliteRepositoryTxer<R> {
    pub fn new<T>(txer: T, config: SqliteRepositoryTxerConfig<R>) -> Self
    where
        T: SqliteTxer + 'static,
    {
        Self {
            timeout: effective_timeout(config.timeout),
            with_tx_fn: config.with_tx_fn,
            txer: Arc::new(txer),
            txn: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn in_tx(&self) -> bool {
        self.txn.is_some()
    }

    /// A copy of `repo` bound to `tx`, or `repo` itself when a transaction
    /// is already in flight.
    ///
    /// # Panics
    /// If `tx` is not a [`SqliteTxWrapper`].
    pub fn with_tx(&self, repo: R, tx: &TxHandle) -> R {
        if self.txn.is_some() {
            return repo;
        }

        let Some(wrapper) = tx.as_any().downcast_ref::<SqliteTxWrapper>() else {
            panic!("SqliteRepositoryTxer::with_tx: expected SqliteTxWrapper");
        };

        let mut cpy = self.clone();
        cpy.txn = Some(Arc::clone(tx));
        (self.with_tx_fn)(repo, cpy, wrapper.native().clone())
    }

    /// Run `f` in a transaction with a transaction-bound copy of `repo`.
    ///
    /// Inside an ambient transaction `f` is called directly.  Otherwise the
    /// whole transaction runs under a context deadline of
    /// [`Self::timeout`], the busy timeout is set right after `BEGIN`, and
    /// failures pass through [`classify_sqlite_timeout`].
    pub async fn begin_tx_func<F, Fut>(&self, ctx: &Context, repo: R, f: F) -> Result<(), TxError>
    where
        F: FnOnce(Context, TxHandle, R) -> Fut,
        Fut: Future<Output = Result<(), TxError>>,
    {
        if let Some(txn) = &self.txn {
            trace!("reusing ambient sqlite transaction");
            return f(ctx.clone(), Arc::clone(txn), repo).await;
        }

        let ctx = ctx.with_timeout(self.timeout);
        let wrapper = self.begin(&ctx).await.map_err(classify_sqlite_timeout)?;
        let handle: TxHandle = Arc::new(wrapper);
        let repo = self.with_tx(repo, &handle);

        executor::run(&ctx, handle.as_ref(), |ctx| f(ctx, Arc::clone(&handle), repo))
            .await
            .map_err(classify_sqlite_timeout)
    }

    async fn begin(&self, ctx: &Context) -> Result<SqliteTxWrapper, TxError> {
        let tx = SqliteTx::new(ctx.run(self.txer.begin_tx()).await??);

        let ms = timeout_millis(self.timeout);
        if let Err(err) = set_busy_timeout(ctx, &tx, ms).await {
            if let Ok(native) = tx.take().await {
                if let Err(rollback) = native.rollback().await {
                    debug!(error = %rollback, "rollback after failed busy_timeout pragma failed");
                }
            }
            return Err(err);
        }

        debug!(timeout_ms = ms, "sqlite transaction started");
        Ok(SqliteTxWrapper::new(tx))
    }
}

async fn set_busy_timeout(ctx: &Context, tx: &SqliteTx, ms: u128) -> Result<(), TxError> {
    let mut guard = tx.lock().await?;
    let conn = guard.as_mut().ok_or(TxError::Closed)?;
    let sql = format!("PRAGMA busy_timeout = {ms}");
    ctx.run(sqlx::Executor::execute(&mut **conn, sql.as_str()))
        .await??;
    Ok(())
}

/// Rewrap deadline expiry and `SQLITE_BUSY` / `SQLITE_LOCKED` (including
/// their extended codes) as [`TxError::Timeout`]; everything else passes
/// through.
pub fn classify_sqlite_timeout(err: TxError) -> TxError {
    let deadline = err.any_cause(&|e: &TxError| {
        matches!(e, TxError::Context(ContextError::DeadlineExceeded))
    });
    let contended = err.any_sqlx(&|e: &sqlx::Error| match e {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff)
            .is_some_and(|code| code == SQLITE_BUSY || code == SQLITE_LOCKED),
        _ => false,
    });
    if deadline || contended {
        err.timeout()
    } else {
        err
    }
}
