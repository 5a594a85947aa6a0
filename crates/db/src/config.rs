//! Connection settings for both backends.
//!
//! Both structs deserialize with every field optional, so a partial config
//! file (or none at all) falls back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

use crate::DbError;

/// Connection-level lock wait for SQLite, before any transaction narrows it.
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Client certificate (PEM).
    pub cert_file: Option<PathBuf>,
    /// Client key (PEM).
    pub key_file: Option<PathBuf>,
    /// CA certificate used to verify the server.
    pub ca_cert_file: Option<PathBuf>,
    /// Encrypt without verifying the server certificate.
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgConfig {
    pub username: String,
    pub password: String,
    /// `host:port`; the port defaults to 5432 when omitted.
    pub host_port: String,
    pub database: String,
    pub max_connections: u32,
    pub tls: Option<TlsConfig>,
    /// Transaction timeout in milliseconds, clamped by the coordinator.
    pub tx_timeout_ms: Option<u64>,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            username: "postgres".into(),
            password: "postgres".into(),
            host_port: "localhost:5432".into(),
            database: "postgres".into(),
            max_connections: 10,
            tls: None,
            tx_timeout_ms: None,
        }
    }
}

impl PgConfig {
    pub fn tx_timeout(&self) -> Option<Duration> {
        self.tx_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, DbError> {
        let (host, port) = match self.host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DbError::Config(format!("invalid port in '{}'", self.host_port)))?;
                (host, port)
            }
            None => (self.host_port.as_str(), 5432),
        };

        let mut options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database);

        if let Some(tls) = &self.tls {
            options = options.ssl_mode(if tls.insecure_skip_verify {
                PgSslMode::Require
            } else {
                PgSslMode::VerifyFull
            });
            if let Some(ca) = &tls.ca_cert_file {
                options = options.ssl_root_cert(ca);
            }
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                options = options.ssl_client_cert(cert).ssl_client_key(key);
            }
        }

        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Directory holding the database file; created if missing.
    pub dir: Option<PathBuf>,
    /// File stem of `<db_name>.db`.  Ignored for in-memory databases.
    pub db_name: String,
    pub in_memory: bool,
    /// Transaction timeout in milliseconds, clamped by the coordinator.
    pub tx_timeout_ms: Option<u64>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            dir: None,
            db_name: "app".into(),
            in_memory: false,
            tx_timeout_ms: None,
        }
    }
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    pub fn tx_timeout(&self) -> Option<Duration> {
        self.tx_timeout_ms.map(Duration::from_millis)
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.in_memory {
            return None;
        }
        let stem = if self.db_name.is_empty() { "app" } else { &self.db_name };
        let file = PathBuf::from(format!("{stem}.db"));
        Some(match &self.dir {
            Some(dir) => dir.join(file),
            None => file,
        })
    }

    pub fn connect_options(&self) -> Result<SqliteConnectOptions, DbError> {
        let options = match self.file_path() {
            None => SqliteConnectOptions::from_str("sqlite::memory:")?,
            Some(file) => SqliteConnectOptions::new()
                .filename(file)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
        };
        Ok(options.foreign_keys(true).busy_timeout(SQLITE_BUSY_TIMEOUT))
    }
}
