//! Transactional behaviour of `SqliteNoteRepository`.
//!
//! Everything here runs against in-memory or temporary-file SQLite, so no
//! external service is required.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use db::pool::{open_sqlite, run_sqlite_migrations};
use db::{DbError, SqliteConfig, SqliteNoteRepository};
use tx::mock::MockTx;
use tx::{Context, Repository, TxError, TxHandle};

fn migrations_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations/sqlite")
}

async fn memory_repo(timeout: Option<Duration>) -> SqliteNoteRepository {
    let pool = open_sqlite(&SqliteConfig::in_memory()).await.expect("open sqlite");
    run_sqlite_migrations(&pool, &migrations_dir(), None).await.expect("migrate");
    SqliteNoteRepository::new(pool, timeout)
}

async fn create_then_panic(ctx: Context, repo: SqliteNoteRepository) -> Result<(), TxError> {
    repo.create(&ctx, "doomed", "never committed").await?;
    panic!("unit of work blew up")
}

// ============================================================
// Commit / rollback
// ============================================================

#[tokio::test]
async fn successful_unit_of_work_is_committed() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();

    repo.begin_tx_func(&ctx, |ctx, _tx, repo| async move {
        assert!(repo.in_tx());
        repo.create(&ctx, "first", "hello").await?;
        repo.create(&ctx, "second", "world").await?;
        Ok(())
    })
    .await
    .expect("transaction should commit");

    assert!(!repo.in_tx(), "root repository stays unbound");
    let titles: Vec<String> = repo
        .list(&ctx)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert_eq!(titles, vec!["first", "second"]);
}

#[tokio::test]
async fn failing_unit_of_work_is_rolled_back() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();

    let err = repo
        .begin_tx_func(&ctx, |ctx, _tx, repo| async move {
            repo.create(&ctx, "draft", "discard me").await?;
            Err(TxError::other("validation failed"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "validation failed");
    assert!(!err.is_timeout());
    assert_eq!(repo.count(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn panicking_unit_of_work_is_rolled_back_and_resumed() {
    let repo = memory_repo(None).await;

    let task_repo = repo.clone();
    let join = tokio::spawn(async move {
        let ctx = Context::background();
        task_repo
            .begin_tx_func(&ctx, |ctx, _tx, repo| create_then_panic(ctx, repo))
            .await
    })
    .await;

    let payload = join.unwrap_err().into_panic();
    assert_eq!(
        payload.downcast_ref::<&str>().copied(),
        Some("unit of work blew up")
    );
    assert_eq!(repo.count(&Context::background()).await.unwrap(), 0);
}

#[tokio::test]
async fn unique_violation_is_not_a_timeout() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();
    repo.create(&ctx, "taken", "first").await.unwrap();

    let err = repo
        .begin_tx_func(&ctx, |ctx, _tx, repo| async move {
            repo.create(&ctx, "taken", "second").await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(!err.is_timeout());
    assert!(matches!(err, TxError::Database(sqlx::Error::Database(_))));
    assert_eq!(err.status_code(), 500);
    assert_eq!(repo.count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn delete_and_get_report_missing_rows() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();
    let note = repo.create(&ctx, "short-lived", "bye").await.unwrap();

    assert_eq!(repo.get(&ctx, note.id).await.unwrap(), note);
    repo.delete(&ctx, note.id).await.unwrap();
    assert!(matches!(repo.get(&ctx, note.id).await, Err(DbError::NotFound)));
    assert!(matches!(repo.delete(&ctx, note.id).await, Err(DbError::NotFound)));
}

// ============================================================
// Nesting
// ============================================================

#[tokio::test]
async fn nested_call_reuses_the_ambient_transaction() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();

    let err = repo
        .begin_tx_func(&ctx, |ctx, outer_tx, repo| async move {
            repo.create(&ctx, "outer", "o").await?;

            let expected = Arc::clone(&outer_tx);
            repo.begin_tx_func(&ctx, |ctx, inner_tx, repo| async move {
                assert!(Arc::ptr_eq(&inner_tx, &expected));
                repo.create(&ctx, "inner", "i").await?;
                Ok(())
            })
            .await?;

            assert_eq!(repo.count(&ctx).await?, 2);
            Err(TxError::other("abort everything"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "abort everything");
    assert_eq!(repo.count(&ctx).await.unwrap(), 0, "inner writes roll back too");
}

#[tokio::test]
async fn with_tx_inside_a_transaction_returns_the_same_binding() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();

    repo.begin_tx_func(&ctx, |ctx, tx, repo| async move {
        let again = repo.with_tx(&tx);
        assert!(again.in_tx());
        again.create(&ctx, "via with_tx", "").await?;
        assert_eq!(repo.count(&ctx).await?, 1);
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(repo.count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
#[should_panic(expected = "expected SqliteTxWrapper")]
async fn with_tx_rejects_a_foreign_handle() {
    let repo = memory_repo(None).await;
    let handle: TxHandle = Arc::new(MockTx::new());
    repo.with_tx(&handle);
}

// ============================================================
// Timeouts
// ============================================================

#[tokio::test]
async fn busy_timeout_follows_the_coordinator_timeout() {
    let ctx = Context::background();

    let repo = memory_repo(None).await;
    assert_eq!(repo.timeout(), Duration::from_secs(10));
    repo.begin_tx_func(&ctx, |ctx, _tx, repo| async move {
        assert_eq!(repo.busy_timeout(&ctx).await?, 10_000);
        Ok(())
    })
    .await
    .unwrap();

    let repo = memory_repo(Some(Duration::from_millis(250))).await;
    repo.begin_tx_func(&ctx, |ctx, _tx, repo| async move {
        assert_eq!(repo.busy_timeout(&ctx).await?, 250);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn out_of_range_timeouts_fall_back_to_default() {
    for timeout in [Duration::ZERO, Duration::from_secs(30)] {
        let repo = memory_repo(Some(timeout)).await;
        assert_eq!(repo.timeout(), tx::DEFAULT_TIMEOUT);
    }
}

#[tokio::test]
async fn slow_unit_of_work_times_out_and_rolls_back() {
    let repo = memory_repo(Some(Duration::from_millis(50))).await;
    let ctx = Context::background();

    let err = repo
        .begin_tx_func(&ctx, |ctx, _tx, repo| async move {
            repo.create(&ctx, "slow", "too late").await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert_eq!(err.status_code(), 409);
    assert_eq!(repo.count(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn cancelled_context_never_commits() {
    let repo = memory_repo(None).await;
    let ctx = Context::background();

    let err = repo
        .begin_tx_func(&ctx, |ctx, _tx, repo| async move {
            repo.create(&ctx, "cancelled", "").await?;
            ctx.cancel();
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(!err.is_timeout(), "cancellation is not a timeout");
    // Cancellation is shared with the caller's context.
    assert_eq!(ctx.err(), Some(tx::ContextError::Cancelled));

    let fresh = Context::background();
    assert_eq!(repo.count(&fresh).await.unwrap(), 0);
}

#[tokio::test]
async fn lock_contention_surfaces_as_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = SqliteConfig {
        dir: Some(tmp.path().to_path_buf()),
        db_name: "contended".into(),
        ..SqliteConfig::default()
    };

    let holder_pool = open_sqlite(&cfg).await.unwrap();
    run_sqlite_migrations(&holder_pool, &migrations_dir(), None).await.unwrap();
    let holder = SqliteNoteRepository::new(holder_pool, None);

    let waiter_pool = open_sqlite(&cfg).await.unwrap();
    let waiter = SqliteNoteRepository::new(waiter_pool, Some(Duration::from_millis(50)));

    let ctx = Context::background();
    holder
        .begin_tx_func(&ctx, |ctx, _tx, holder| async move {
            // Holds the write lock until this unit of work returns.
            holder.create(&ctx, "held", "").await?;

            let err = waiter
                .begin_tx_func(&ctx, |ctx, _tx, waiter| async move {
                    waiter.create(&ctx, "blocked", "").await?;
                    Ok(())
                })
                .await
                .unwrap_err();
            assert!(err.is_timeout(), "expected timeout, got {err:?}");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(holder.count(&ctx).await.unwrap(), 1);
}
