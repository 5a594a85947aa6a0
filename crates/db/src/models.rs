//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A row of the `notes` table, identical on both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct NoteRow {
    pub id: Uuid,
    /// Unique across the table.
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
