//! Hive persistence layer for session, credential and message records.
//!
//! An async API around SQLite (sqlx). Sandboxes are runtime-only and never
//! stored here; everything that must survive a host restart is: the session
//! catalog (one row per user/agent pair), credential quota and cooldown
//! bookkeeping, and the append-only per-session message ledger.

mod credentials;
mod messages;
mod sessions;

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

pub use credentials::{CredentialRecord, NewCredential};
pub use messages::{MessageRecord, MessageRole};
pub use sessions::{EndReason, SessionRecord, SessionState, SessionUpdate};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/hive/hive.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))
            .foreign_keys(true);
        if !in_memory {
            // Readers never block the single writer.
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` opens a fresh database, so the pool
        // must hold exactly one connection for the lifetime of the handle.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(8)
        };

        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool for callers composing their own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Domain errors surfaced by the store. Other failures travel as plain
/// `anyhow::Error` and can be told apart with `downcast_ref::<StoreError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("credential '{0}' not found")]
    CredentialNotFound(String),
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

pub(crate) fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

pub(crate) fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_datetime).transpose()
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|err| anyhow!("invalid uuid '{}': {}", value, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_survives_concurrent_queries() {
        let db = Database::connect("sqlite::memory:").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.ensure_session(&format!("user-{i}"), "agent").await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sessions = db.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 8);
    }

    #[tokio::test]
    async fn file_database_is_reopened_with_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");

        let session_id = {
            let db = Database::connect_file(&path).await.unwrap();
            db.ensure_session("alice", "writer").await.unwrap().id
        };

        let reopened = Database::connect_file(&path).await.unwrap();
        let fetched = reopened.fetch_session(session_id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "alice");
        assert_eq!(fetched.agent_id, "writer");
    }
}
