//! Postgres coordinator backed by an sqlx connection pool.
//!
//! Transaction duration is enforced by the server: every new transaction
//! gets `SET LOCAL transaction_timeout` and
//! `SET LOCAL idle_in_transaction_session_timeout` equal to the configured
//! timeout.  `transaction_timeout` requires Postgres 17 or newer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, trace};

use crate::shared::SharedTx;
use crate::{effective_timeout, executor, timeout_millis, Context, Tx, TxError, TxHandle};

/// SQLSTATE for `idle_in_transaction_session_timeout`.
pub const IDLE_IN_TRANSACTION_SESSION_TIMEOUT: &str = "25P03";

/// SQLSTATE for `transaction_timeout`.
pub const TRANSACTION_TIMEOUT: &str = "25P04";

/// Anything that can begin a Postgres transaction.  Implemented for
/// [`PgPool`].
#[async_trait]
pub trait PgTxer: Send + Sync {
    async fn begin_tx(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error>;
}

#[async_trait]
impl PgTxer for PgPool {
    async fn begin_tx(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.begin().await
    }
}

/// The native Postgres transaction; satisfies [`Tx`] directly.
pub type PgTx = SharedTx<Postgres>;

#[async_trait]
impl Tx for SharedTx<Postgres> {
    async fn commit(&self, ctx: &Context) -> Result<(), TxError> {
        let tx = self.take().await?;
        ctx.run(tx.commit()).await??;
        Ok(())
    }

    async fn rollback(&self, ctx: &Context) -> Result<(), TxError> {
        let tx = self.take().await?;
        ctx.run(tx.rollback()).await??;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

type PgWithTxFn<R> = Arc<dyn Fn(R, PgRepositoryTxer<R>, PgTx) -> R + Send + Sync>;

/// Construction parameters for [`PgRepositoryTxer`].
pub struct PgRepositoryTxerConfig<R> {
    /// Maximum duration of a whole transaction.  Zero or anything above
    /// [`crate::DEFAULT_TIMEOUT`] falls back to the default.
    pub timeout: Option<Duration>,

    /// Binder producing a transaction-bound copy of the repository.
    ///
    /// It must clone the repository passed in, point the clone's queries at
    /// the given [`PgTx`], store the given coordinator on the clone so
    /// nested calls reuse the ambient transaction, and return the clone.
    with_tx_fn: PgWithTxFn<R>,
}

impl<R> PgRepositoryTxerConfig<R> {
    pub fn new<F>(with_tx_fn: F) -> Self
    where
        F: Fn(R, PgRepositoryTxer<R>, PgTx) -> R + Send + Sync + 'static,
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

/// Adds transactional behaviour to repository type `R` over Postgres.
///
/// The root coordinator (no active transaction) may be shared freely.  A
/// copy carrying an active transaction is bound to one connection and
/// must not be used from concurrent tasks.
pub struct PgRepositoryTxer<R> {
    timeout: Duration,
    with_tx_fn: PgWithTxFn<R>,
    txer: Arc<dyn PgTxer>,
    /// Set only on copies produced while a transaction is in flight.
    txn: Option<TxHandle>,
}

impl<R> Clone for PgRepositoryTxer<R> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            with_tx_fn: Arc::clone(&self.with_tx_fn),
            txer: Arc::clone(&self.txer),
            txn: self.txn.clone(),
        }
    }
}

impl<R> std::fmt::Debug for PgRepositoryTxer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRepositoryTxer")
            .field("timeout", &self.timeout)
            .field("in_tx", &self.in_tx())
            .finish()
    }
}

impl<R> PgRepositoryTxer<R> {
    pub fn new<T>(txer: T, config: PgRepositoryTxerConfig<R>) -> Self
    where
        T: PgTxer + 'static,
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

    /// Whether this coordinator is inside a transaction.
    pub fn in_tx(&self) -> bool {
        self.txn.is_some()
    }

    /// A copy of `repo` bound to `tx`, or `repo` itself when a transaction
    /// is already in flight.
    ///
    /// # Panics
    /// If `tx` is not a [`PgTx`].
    pub fn with_tx(&self, repo: R, tx: &TxHandle) -> R {
        if self.txn.is_some() {
            return repo;
        }

        let Some(pg_tx) = tx.as_any().downcast_ref::<PgTx>() else {
            panic!("PgRepositoryTxer::with_tx: expected PgTx");
        };

        let mut cpy = self.clone();
        cpy.txn = Some(Arc::clone(tx));
        (self.with_tx_fn)(repo, cpy, pg_tx.clone())
    }

    /// Run `f` in a transaction with a transaction-bound copy of `repo`.
    ///
    /// Inside an ambient transaction `f` is called directly with the
    /// existing handle.  Otherwise a transaction is begun, its server-side
    /// timeouts are set, and `f` is driven through [`executor::run`]; any
    /// failure is passed through [`classify_pg_timeout`].
    pub async fn begin_tx_func<F, Fut>(&self, ctx: &Context, repo: R, f: F) -> Result<(), TxError>
    where
        F: FnOnce(Context, TxHandle, R) -> Fut,
        Fut: Future<Output = Result<(), TxError>>,
    {
        if let Some(txn) = &self.txn {
            trace!("reusing ambient postgres transaction");
            return f(ctx.clone(), Arc::clone(txn), repo).await;
        }

        let tx = self.begin(ctx).await.map_err(classify_pg_timeout)?;
        let handle: TxHandle = Arc::new(tx);
        let repo = self.with_tx(repo, &handle);

        executor::run(ctx, handle.as_ref(), |ctx| f(ctx, Arc::clone(&handle), repo))
            .await
            .map_err(classify_pg_timeout)
    }

    async fn begin(&self, ctx: &Context) -> Result<PgTx, TxError> {
        let tx = PgTx::new(ctx.run(self.txer.begin_tx()).await??);

        let ms = timeout_millis(self.timeout);
        for sql in &session_directives(ms) {
            if let Err(err) = exec_directive(ctx, &tx, sql).await {
                if let Ok(native) = tx.take().await {
                    if let Err(rollback) = native.rollback().await {
                        debug!(
                            error = %rollback,
                            directive = %sql,
                            "rollback after failed session directive failed"
                        );
                    }
                }
                return Err(err);
            }
        }

        debug!(timeout_ms = ms, "postgres transaction started");
        Ok(tx)
    }
}

fn session_directives(ms: u128) -> [String; 2] {
    [
        format!("SET LOCAL transaction_timeout = '{ms}ms'"),
        format!("SET LOCAL idle_in_transaction_session_timeout = '{ms}ms'"),
    ]
}

async fn exec_directive(ctx: &Context, tx: &PgTx, sql: &str) -> Result<(), TxError> {
    let mut guard = tx.lock().await?;
    let conn = guard.as_mut().ok_or(TxError::Closed)?;
    ctx.run(sqlx::Executor::execute(&mut **conn, sql)).await??;
    Ok(())
}

/// Rewrap Postgres session/transaction timeout errors as
/// [`TxError::Timeout`]; everything else passes through.
pub fn classify_pg_timeout(err: TxError) -> TxError {
    let timed_out = err.any_sqlx(&|e: &sqlx::Error| match e {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(IDLE_IN_TRANSACTION_SESSION_TIMEOUT | TRANSACTION_TIMEOUT)
        ),
        _ => false,
    });
    if timed_out {
        err.timeout()
    } else {
        err
    }
}
