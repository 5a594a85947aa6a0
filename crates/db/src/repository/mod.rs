//! Repositories over the `notes` table, one per backend.
//!
//! A repository queries either its pool or, once bound by its coordinator,
//! the shared transaction.  Every operation takes a [`tx::Context`] and
//! runs under it.

use sqlx::pool::PoolConnection;
use sqlx::{Database, Pool, Transaction};
use tokio::sync::MutexGuard;
use tx::{SharedTx, TxError};

use crate::DbError;

pub mod notes;
pub mod sqlite_notes;

pub use notes::PgNoteRepository;
pub use sqlite_notes::SqliteNoteRepository;

/// Where a repository sends its queries.
pub enum Target<DB: Database> {
    Pool(Pool<DB>),
    Tx(SharedTx<DB>),
}

impl<DB: Database> Clone for Target<DB> {
    fn clone(&self) -> Self {
        match self {
            Target::Pool(pool) => Target::Pool(pool.clone()),
            Target::Tx(tx) => Target::Tx(tx.clone()),
        }
    }
}

impl<DB: Database> std::fmt::Debug for Target<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Pool(pool) => f.debug_tuple("Pool").field(pool).finish(),
            Target::Tx(tx) => f.debug_tuple("Tx").field(tx).finish(),
        }
    }
}

impl<DB: Database> Target<DB> {
    /// Check out a connection: a fresh one from the pool, or the locked
    /// transaction.
    pub async fn conn(&self) -> Result<Conn<'_, DB>, DbError> {
        match self {
            Target::Pool(pool) => Ok(Conn::Pooled(pool.acquire().await?)),
            Target::Tx(tx) => Ok(Conn::Tx(tx.lock().await?)),
        }
    }

    pub fn is_tx(&self) -> bool {
        matches!(self, Target::Tx(_))
    }
}

pub enum Conn<'a, DB: Database> {
    Pooled(PoolConnection<DB>),
    Tx(MutexGuard<'a, Option<Transaction<'static, DB>>>),
}

impl<DB: Database> Conn<'_, DB> {
    pub fn get(&mut self) -> Result<&mut DB::Connection, DbError> {
        match self {
            Conn::Pooled(conn) => Ok(&mut **conn),
            Conn::Tx(guard) => match guard.as_mut() {
                Some(tx) => Ok(&mut **tx),
                None => Err(TxError::Closed.into()),
            },
        }
    }
}
