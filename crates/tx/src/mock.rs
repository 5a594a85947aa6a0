//! `MockTx`: a test double for [`Tx`].
//!
//! Records every commit and rollback it receives so tests can assert the
//! exactly-once resolution guarantee without a database.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::{Context, Tx, TxError};

/// Behaviour injected into `MockTx` at construction time.
#[derive(Debug, Clone, Copy, Default)]
pub enum MockBehaviour {
    #[default]
    Succeed,
    /// `commit` fails with [`TxError::Closed`].
    FailCommit,
    /// `rollback` fails with [`TxError::Closed`].
    FailRollback,
}

#[derive(Debug, Default)]
pub struct MockTx {
    pub behaviour: MockBehaviour,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MockTx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_commit() -> Self {
        Self {
            behaviour: MockBehaviour::FailCommit,
            ..Self::default()
        }
    }

    pub fn failing_rollback() -> Self {
        Self {
            behaviour: MockBehaviour::FailRollback,
            ..Self::default()
        }
    }

    /// Number of times `commit` was called.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of times `rollback` was called.
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tx for MockTx {
    async fn commit(&self, _ctx: &Context) -> Result<(), TxError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            MockBehaviour::FailCommit => Err(TxError::Closed),
            _ => Ok(()),
        }
    }

    async fn rollback(&self, _ctx: &Context) -> Result<(), TxError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            MockBehaviour::FailRollback => Err(TxError::Closed),
            _ => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A driver error carrying an arbitrary SQLSTATE / result code, for
/// exercising the timeout classifiers.
#[derive(Debug)]
pub struct MockDatabaseError {
    pub code: String,
}

impl MockDatabaseError {
    pub fn sqlx(code: impl Into<String>) -> sqlx::Error {
        sqlx::Error::Database(Box::new(Self { code: code.into() }))
    }
}

impl std::fmt::Display for MockDatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock database error (code {})", self.code)
    }
}

impl std::error::Error for MockDatabaseError {}

impl sqlx::error::DatabaseError for MockDatabaseError {
    fn message(&self) -> &str {
        "mock database error"
    }

    fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
        Some(std::borrow::Cow::Borrowed(&self.code))
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        sqlx::error::ErrorKind::Other
    }
}
