//! Connection pools for Postgres and SQLite, plus migrations.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use sqlx::migrate::{Migrate, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Connection, Database, PgPool, Pool, SqlitePool};
use tracing::{debug, info, instrument, warn};

use crate::config::{PgConfig, SqliteConfig};
use crate::DbError;

/// Type alias for the shared Postgres pool used across the whole application.
pub type DbPool = PgPool;

const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_MAX_RETRIES: u32 = 5;

/// Create a Postgres pool from `cfg` and wait until the server answers.
///
/// Connections are opened lazily; the health wait forces the first one.
#[instrument(skip(cfg), fields(host = %cfg.host_port, database = %cfg.database))]
pub async fn create_pool(cfg: &PgConfig) -> Result<DbPool, DbError> {
    info!("Connecting to database (max_connections={})", cfg.max_connections);
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections.max(1))
        .connect_lazy_with(cfg.connect_options()?);

    wait_healthy(&pool, "postgres").await?;
    Ok(pool)
}

/// Open a SQLite pool from `cfg` and wait until it answers.
///
/// The pool holds a single connection: SQLite has one writer, and an
/// in-memory database only lives as long as its connection.
#[instrument(skip(cfg), fields(db_name = %cfg.db_name, in_memory = cfg.in_memory))]
pub async fn open_sqlite(cfg: &SqliteConfig) -> Result<SqlitePool, DbError> {
    if let Some(dir) = cfg.dir.as_deref().filter(|_| !cfg.in_memory) {
        tokio::fs::create_dir_all(dir).await?;
    }

    info!(path = ?cfg.file_path(), "Opening sqlite database");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_lazy_with(cfg.connect_options()?);

    wait_healthy(&pool, "sqlite").await?;
    Ok(pool)
}

/// Ping the pool until it answers, at a constant interval.
async fn wait_healthy<DB: Database>(pool: &Pool<DB>, backend: &'static str) -> Result<(), DbError> {
    let mut retries = 0;
    loop {
        match ping(pool).await {
            Ok(()) => return Ok(()),
            Err(source) if retries >= HEALTH_MAX_RETRIES => {
                return Err(DbError::Unhealthy { backend, source });
            }
            Err(err) => {
                retries += 1;
                warn!(backend, attempt = retries, error = %err, "database not ready, retrying");
                tokio::time::sleep(HEALTH_RETRY_INTERVAL).await;
            }
        }
    }
}

async fn ping<DB: Database>(pool: &Pool<DB>) -> Result<(), sqlx::Error> {
    let attempt = async {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    };
    tokio::time::timeout(HEALTH_PING_TIMEOUT, attempt)
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)?
}

/// Apply the Postgres migrations found in `dir`.
///
/// With `version` set the database is moved to exactly that version, up or
/// down; otherwise every pending migration runs.
pub async fn run_migrations(pool: &DbPool, dir: &Path, version: Option<i64>) -> Result<(), DbError> {
    info!(dir = %dir.display(), ?version, "Running database migrations");
    migrate_dir(pool, dir, version).await
}

/// Apply the SQLite migrations found in `dir`; `version` as for
/// [`run_migrations`].
pub async fn run_sqlite_migrations(
    pool: &SqlitePool,
    dir: &Path,
    version: Option<i64>,
) -> Result<(), DbError> {
    info!(dir = %dir.display(), ?version, "Running sqlite migrations");
    migrate_dir(pool, dir, version).await
}

async fn migrate_dir<DB>(pool: &Pool<DB>, dir: &Path, version: Option<i64>) -> Result<(), DbError>
where
    DB: Database,
    DB::Connection: Migrate,
{
    let migrator = Migrator::new(dir).await?;
    let Some(target) = version else {
        migrator.run(pool).await?;
        return Ok(());
    };

    // Version 0 means "nothing applied".
    if target != 0 && !migrator.version_exists(target) {
        return Err(DbError::MigrationTarget {
            target,
            reason: "no such migration".into(),
        });
    }

    // Down first; this also validates the applied history.
    migrator.undo(pool, target).await?;

    let mut conn = pool.acquire().await?;
    let applied: HashSet<i64> = conn
        .list_applied_migrations()
        .await?
        .into_iter()
        .map(|m| m.version)
        .collect();

    if let Some(stuck) = applied.iter().copied().filter(|v| *v > target).max() {
        return Err(DbError::MigrationTarget {
            target,
            reason: format!("migration {stuck} has no down script"),
        });
    }

    for migration in migrator.iter().filter(|m| {
        m.migration_type.is_up_migration() && m.version <= target && !applied.contains(&m.version)
    }) {
        conn.apply(migration).await?;
        debug!(version = migration.version, "applied migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_sqlite_is_healthy() {
        let pool = open_sqlite(&SqliteConfig::in_memory()).await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn file_sqlite_creates_directory_and_migrates() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = SqliteConfig {
            dir: Some(tmp.path().join("nested")),
            db_name: "notes".into(),
            ..SqliteConfig::default()
        };
        let pool = open_sqlite(&cfg).await.unwrap();
        assert!(tmp.path().join("nested/notes.db").exists());

        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations/sqlite");
        run_sqlite_migrations(&pool, &dir, None).await.unwrap();
        // Already up to date.
        run_sqlite_migrations(&pool, &dir, None).await.unwrap();

        let journal: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(journal, "wal");
    }

    #[tokio::test]
    async fn missing_migration_dir_is_an_error() {
        let pool = open_sqlite(&SqliteConfig::in_memory()).await.unwrap();
        let err = run_sqlite_migrations(&pool, Path::new("/nonexistent/migrations"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Migration(_)));
    }

    fn write_migrations(dir: &Path, files: &[(&str, &str)]) {
        for (name, sql) in files {
            std::fs::write(dir.join(name), sql).unwrap();
        }
    }

    async fn has_table(pool: &SqlitePool, name: &str) -> bool {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap();
        n == 1
    }

    async fn file_pool(tmp: &tempfile::TempDir) -> SqlitePool {
        let cfg = SqliteConfig {
            dir: Some(tmp.path().join("db")),
            db_name: "versions".into(),
            ..SqliteConfig::default()
        };
        open_sqlite(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn migrates_up_and_down_to_a_target_version() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("migrations");
        std::fs::create_dir(&dir).unwrap();
        write_migrations(
            &dir,
            &[
                ("1_notes.up.sql", "CREATE TABLE notes (id INTEGER PRIMARY KEY);"),
                ("1_notes.down.sql", "DROP TABLE notes;"),
                ("2_tags.up.sql", "CREATE TABLE tags (name TEXT NOT NULL);"),
                ("2_tags.down.sql", "DROP TABLE tags;"),
                ("3_archive.up.sql", "CREATE TABLE archive (id INTEGER PRIMARY KEY);"),
                ("3_archive.down.sql", "DROP TABLE archive;"),
            ],
        );
        let pool = file_pool(&tmp).await;

        run_sqlite_migrations(&pool, &dir, Some(2)).await.unwrap();
        assert!(has_table(&pool, "notes").await);
        assert!(has_table(&pool, "tags").await);
        assert!(!has_table(&pool, "archive").await);

        run_sqlite_migrations(&pool, &dir, Some(1)).await.unwrap();
        assert!(has_table(&pool, "notes").await);
        assert!(!has_table(&pool, "tags").await);

        run_sqlite_migrations(&pool, &dir, None).await.unwrap();
        assert!(has_table(&pool, "archive").await);

        // Already there.
        run_sqlite_migrations(&pool, &dir, Some(3)).await.unwrap();

        run_sqlite_migrations(&pool, &dir, Some(0)).await.unwrap();
        assert!(!has_table(&pool, "notes").await);
        assert!(!has_table(&pool, "archive").await);
    }

    #[tokio::test]
    async fn unknown_target_version_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("migrations");
        std::fs::create_dir(&dir).unwrap();
        write_migrations(&dir, &[("1_notes.sql", "CREATE TABLE notes (id INTEGER PRIMARY KEY);")]);
        let pool = file_pool(&tmp).await;

        let err = run_sqlite_migrations(&pool, &dir, Some(7)).await.unwrap_err();
        assert!(matches!(err, DbError::MigrationTarget { target: 7, .. }));
        assert!(!has_table(&pool, "notes").await);
    }

    #[tokio::test]
    async fn irreversible_migrations_cannot_go_down() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("migrations");
        std::fs::create_dir(&dir).unwrap();
        write_migrations(
            &dir,
            &[
                ("1_notes.sql", "CREATE TABLE notes (id INTEGER PRIMARY KEY);"),
                ("2_tags.sql", "CREATE TABLE tags (name TEXT NOT NULL);"),
            ],
        );
        let pool = file_pool(&tmp).await;
        run_sqlite_migrations(&pool, &dir, None).await.unwrap();

        let err = run_sqlite_migrations(&pool, &dir, Some(1)).await.unwrap_err();
        match err {
            DbError::MigrationTarget { target, reason } => {
                assert_eq!(target, 1);
                assert!(reason.contains("migration 2"), "{reason}");
            }
            other => panic!("expected target error, got {other:?}"),
        }
        assert!(has_table(&pool, "tags").await);
    }
}
