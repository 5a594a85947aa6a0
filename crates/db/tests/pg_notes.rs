//! Live Postgres tests for `PgNoteRepository`.
//!
//! Ignored by default.  Point `TXKIT_TEST_DATABASE_URL` at a disposable
//! Postgres 17+ database and run with `--ignored`.

use std::path::Path;
use std::time::Duration;

use db::pool::run_migrations;
use db::PgNoteRepository;
use sqlx::postgres::PgPoolOptions;
use tx::{Context, Repository, TxError};

async fn repo(timeout: Option<Duration>) -> PgNoteRepository {
    let url = std::env::var("TXKIT_TEST_DATABASE_URL")
        .expect("TXKIT_TEST_DATABASE_URL must be set for live Postgres tests");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to Postgres");

    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations/postgres");
    run_migrations(&pool, &dir, None).await.expect("migrate");
    sqlx::query("TRUNCATE notes").execute(&pool).await.expect("truncate");

    PgNoteRepository::new(pool, timeout)
}

#[tokio::test]
#[ignore]
async fn commit_and_rollback_against_postgres() {
    let repo = repo(None).await;
    let ctx = Context::background();

    repo.begin_tx_func(&ctx, |ctx, _tx, repo| async move {
        repo.create(&ctx, "kept", "committed").await?;
        Ok(())
    })
    .await
    .unwrap();

    let err = repo
        .begin_tx_func(&ctx, |ctx, _tx, repo| async move {
            repo.create(&ctx, "dropped", "rolled back").await?;
            Err(TxError::other("changed my mind"))
        })
        .await
        .unwrap_err();
    assert!(!err.is_timeout());

    let titles: Vec<String> = repo.list(&ctx).await.unwrap().into_iter().map(|n| n.title).collect();
    assert_eq!(titles, vec!["kept"]);
}

#[tokio::test]
#[ignore]
async fn server_side_timeout_is_classified() {
    let repo = repo(Some(Duration::from_millis(50))).await;
    let ctx = Context::background();

    let err = repo
        .begin_tx_func(&ctx, |ctx, _tx, repo| async move {
            repo.create(&ctx, "slow", "").await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            repo.count(&ctx).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert_eq!(repo.count(&ctx).await.unwrap(), 0);
}
