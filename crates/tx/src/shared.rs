//! A native sqlx transaction shared between a coordinator and the
//! repository copies bound to it.

use std::sync::Arc;

use sqlx::{Database, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::TxError;

/// Cloneable handle to one open `sqlx::Transaction`.
///
/// Every clone points at the same transaction.  Repositories lock it to
/// issue queries; the coordinator takes it out exactly once to commit or
/// roll back, after which every clone reports [`TxError::Closed`].
pub struct SharedTx<DB: Database> {
    inner: Arc<Mutex<Option<Transaction<'static, DB>>>>,
}

impl<DB: Database> Clone for SharedTx<DB> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<DB: Database> std::fmt::Debug for SharedTx<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTx")
            .field("database", &DB::NAME)
            .finish_non_exhaustive()
    }
}

impl<DB: Database> SharedTx<DB> {
    pub fn new(tx: Transaction<'static, DB>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Lock the transaction for a query.
    ///
    /// ```ignore
    /// let mut guard = tx.lock().await?;
    /// let conn = guard.as_mut().ok_or(TxError::Closed)?;
    /// sqlx::query("DELETE FROM notes").execute(&mut **conn).await?;
    /// ```
    pub async fn lock(&self) -> Result<MutexGuard<'_, Option<Transaction<'static, DB>>>, TxError> {
        let guard = self.inner.lock().await;
        if guard.is_none() {
            return Err(TxError::Closed);
        }
        Ok(guard)
    }

    /// Take the transaction out to resolve it.  Only the first caller gets it.
    pub async fn take(&self) -> Result<Transaction<'static, DB>, TxError> {
        self.inner.lock().await.take().ok_or(TxError::Closed)
    }

    /// Whether the transaction is still open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// True when both handles refer to the same transaction.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
