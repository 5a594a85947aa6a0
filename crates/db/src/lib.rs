//! `db` crate: persistence plumbing for the `tx` coordinators.
//!
//! Provides connection pools for Postgres and SQLite, migrations, typed
//! row structs, and a reference `notes` repository per backend that is
//! fully transactional through [`tx::Repository`].

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use config::{PgConfig, SqliteConfig, TlsConfig};
pub use error::DbError;
pub use pool::DbPool;
pub use repository::{PgNoteRepository, SqliteNoteRepository};
