//! `txkit` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`: apply a directory of migrations to Postgres or SQLite,
//!   optionally moving up or down to a given version.
//! - `check`: open the database and run one transaction through a
//!   coordinator, reporting success or a timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use db::pool::{create_pool, open_sqlite, run_migrations, run_sqlite_migrations};
use db::{PgConfig, SqliteConfig};
use serde::Deserialize;
use tracing::info;
use tx::{
    Context, PgRepositoryTxer, PgRepositoryTxerConfig, PgTx, SqliteRepositoryTxer,
    SqliteRepositoryTxerConfig, SqliteTx, TxError,
};

#[derive(Parser)]
#[command(
    name = "txkit",
    about = "Transactional repositories over Postgres and SQLite",
    version
)]
struct Cli {
    /// JSON file with optional `postgres` and `sqlite` sections.
    #[arg(long, global = true, env = "TXKIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Postgres,
    Sqlite,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate {
        #[arg(long, value_enum)]
        backend: Backend,
        /// Directory of `<version>_<name>.sql` or `.up.sql`/`.down.sql` files.
        #[arg(long, env = "TXKIT_MIGRATIONS_DIR")]
        dir: PathBuf,
        /// Target version; reverts newer migrations when below the current one.
        /// `0` reverts everything.
        #[arg(long = "version")]
        version: Option<i64>,
    },
    /// Run an empty transaction to verify connectivity and timeouts.
    Check {
        #[arg(long, value_enum)]
        backend: Backend,
        /// Overrides the configured transaction timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    postgres: PgConfig,
    sqlite: SqliteConfig,
}

impl Settings {
    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Migrate { backend, dir, version } => {
            match backend {
                Backend::Postgres => {
                    let pool = create_pool(&settings.postgres).await?;
                    run_migrations(&pool, &dir, version).await?;
                }
                Backend::Sqlite => {
                    let pool = open_sqlite(&settings.sqlite).await?;
                    run_sqlite_migrations(&pool, &dir, version).await?;
                }
            }
            info!("Migrations applied successfully");
        }
        Command::Check { backend, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            match backend {
                Backend::Postgres => check_postgres(&settings.postgres, timeout).await?,
                Backend::Sqlite => check_sqlite(&settings.sqlite, timeout).await?,
            }
        }
    }

    Ok(())
}

async fn check_postgres(cfg: &PgConfig, timeout: Option<Duration>) -> anyhow::Result<()> {
    let pool = create_pool(cfg).await?;

    let mut config =
        PgRepositoryTxerConfig::new(|_: Option<PgTx>, _txer: PgRepositoryTxer<_>, tx| Some(tx));
    config.timeout = timeout.or(cfg.tx_timeout());
    let txer = PgRepositoryTxer::new(pool, config);

    let res = txer
        .begin_tx_func(&Context::background(), None, |ctx, _tx, bound| async move {
            let tx = bound.ok_or(TxError::Closed)?;
            let mut guard = tx.lock().await?;
            let conn = guard.as_mut().ok_or(TxError::Closed)?;
            ctx.run(sqlx::query("SELECT 1").execute(&mut **conn)).await??;
            Ok(())
        })
        .await;

    report("postgres", txer.timeout(), res)
}

async fn check_sqlite(cfg: &SqliteConfig, timeout: Option<Duration>) -> anyhow::Result<()> {
    let pool = open_sqlite(cfg).await?;

    let mut config = SqliteRepositoryTxerConfig::new(
        |_: Option<SqliteTx>, _txer: SqliteRepositoryTxer<_>, tx| Some(tx),
    );
    config.timeout = timeout.or(cfg.tx_timeout());
    let txer = SqliteRepositoryTxer::new(pool, config);

    let res = txer
        .begin_tx_func(&Context::background(), None, |ctx, _tx, bound| async move {
            let tx = bound.ok_or(TxError::Closed)?;
            let mut guard = tx.lock().await?;
            let conn = guard.as_mut().ok_or(TxError::Closed)?;
            ctx.run(sqlx::query("SELECT 1").execute(&mut **conn)).await??;
            Ok(())
        })
        .await;

    report("sqlite", txer.timeout(), res)
}

fn report(backend: &str, timeout: Duration, res: Result<(), TxError>) -> anyhow::Result<()> {
    match res {
        Ok(()) => {
            println!("✅ {backend}: transaction committed (timeout {}ms)", timeout.as_millis());
            Ok(())
        }
        Err(err) if err.is_timeout() => {
            bail!("{backend}: transaction timed out after {}ms: {err}", timeout.as_millis())
        }
        Err(err) => Err(err).with_context(|| format!("{backend}: transaction failed")),
    }
}
