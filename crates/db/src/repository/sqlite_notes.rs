//! SQLite notes repository.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool};
use tx::{
    Context, Repository, SqliteRepositoryTxer, SqliteRepositoryTxerConfig, SqliteTx, TxError,
    TxHandle,
};
use uuid::Uuid;

use super::Target;
use crate::{models::NoteRow, DbError};

#[derive(Debug, Clone)]
pub struct SqliteNoteRepository {
    target: Target<Sqlite>,
    txer: Arc<SqliteRepositoryTxer<SqliteNoteRepository>>,
}

impl SqliteNoteRepository {
    pub fn new(pool: SqlitePool, timeout: Option<Duration>) -> Self {
        let mut config = SqliteRepositoryTxerConfig::new(Self::bind);
        config.timeout = timeout;
        let txer = SqliteRepositoryTxer::new(pool.clone(), config);
        Self {
            target: Target::Pool(pool),
            txer: Arc::new(txer),
        }
    }

    fn bind(mut repo: Self, txer: SqliteRepositoryTxer<Self>, tx: SqliteTx) -> Self {
        repo.target = Target::Tx(tx);
        repo.txer = Arc::new(txer);
        repo
    }

    pub fn in_tx(&self) -> bool {
        self.txer.in_tx()
    }

    pub fn timeout(&self) -> Duration {
        self.txer.timeout()
    }

    /// Current `PRAGMA busy_timeout` of the connection this repository
    /// queries, in milliseconds.
    pub async fn busy_timeout(&self, ctx: &Context) -> Result<i64, DbError> {
        ctx.run(async {
            let mut conn = self.target.conn().await?;
            let ms = sqlx::query_scalar::<_, i64>("PRAGMA busy_timeout")
                .fetch_one(conn.get()?)
                .await?;
            Ok::<_, DbError>(ms)
        })
        .await?
    }

    pub async fn create(&self, ctx: &Context, title: &str, body: &str) -> Result<NoteRow, DbError> {
        ctx.run(async {
            let mut conn = self.target.conn().await?;
            let row = sqlx::query_as::<_, NoteRow>(
                r#"
                INSERT INTO notes (id, title, body, created_at)
                VALUES (?, ?, ?, ?)
                RETURNING id, title, body, created_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(title)
            .bind(body)
            .bind(Utc::now())
            .fetch_one(conn.get()?)
            .await?;
            Ok::<_, DbError>(row)
        })
        .await?
    }

    pub async fn get(&self, ctx: &Context, id: Uuid) -> Result<NoteRow, DbError> {
        ctx.run(async {
            let mut conn = self.target.conn().await?;
            let row = sqlx::query_as::<_, NoteRow>(
                "SELECT id, title, body, created_at FROM notes WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(conn.get()?)
            .await?;
            row.ok_or(DbError::NotFound)
        })
        .await?
    }

    pub async fn list(&self, ctx: &Context) -> Result<Vec<NoteRow>, DbError> {
        ctx.run(async {
            let mut conn = self.target.conn().await?;
            let rows = sqlx::query_as::<_, NoteRow>(
                "SELECT id, title, body, created_at FROM notes ORDER BY created_at ASC, title ASC",
            )
            .fetch_all(conn.get()?)
            .await?;
            Ok::<_, DbError>(rows)
        })
        .await?
    }

    pub async fn delete(&self, ctx: &Context, id: Uuid) -> Result<(), DbError> {
        ctx.run(async {
            let mut conn = self.target.conn().await?;
            let res = sqlx::query("DELETE FROM notes WHERE id = ?")
                .bind(id)
                .execute(conn.get()?)
                .await?;
            match res.rows_affected() {
                0 => Err(DbError::NotFound),
                _ => Ok(()),
            }
        })
        .await?
    }

    pub async fn count(&self, ctx: &Context) -> Result<i64, DbError> {
        ctx.run(async {
            let mut conn = self.target.conn().await?;
            let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes")
                .fetch_one(conn.get()?)
                .await?;
            Ok::<_, DbError>(n)
        })
        .await?
    }
}

impl Repository<SqliteNoteRepository> for SqliteNoteRepository {
    fn with_tx(&self, tx: &TxHandle) -> SqliteNoteRepository {
        self.txer.with_tx(self.clone(), tx)
    }

    fn begin_tx_func<F, Fut>(
        &self,
        ctx: &Context,
        f: F,
    ) -> impl Future<Output = Result<(), TxError>> + Send
    where
        F: FnOnce(Context, TxHandle, SqliteNoteRepository) -> Fut + Send,
        Fut: Future<Output = Result<(), TxError>> + Send,
    {
        self.txer.begin_tx_func(ctx, self.clone(), f)
    }
}
