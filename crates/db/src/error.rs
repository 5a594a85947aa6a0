//! Typed error type for the db crate.

use thiserror::Error;
use tx::{ContextError, TxError};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cannot migrate to version {target}: {reason}")]
    MigrationTarget { target: i64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{backend} connection unhealthy: {source}")]
    Unhealthy {
        backend: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Tx(#[from] TxError),
}

/// Repository errors flow back through the coordinators as `TxError`.
/// Driver and context errors keep their identity so the timeout
/// classifiers still recognise them.
impl From<DbError> for TxError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlx(err) => TxError::Database(err),
            DbError::Context(err) => TxError::Context(err),
            DbError::Tx(err) => err,
            other => TxError::other(other),
        }
    }
}
