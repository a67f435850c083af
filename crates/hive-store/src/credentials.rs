use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{parse_datetime, parse_optional_datetime, Database, StoreError};

/// Persisted credential bookkeeping. The secret itself is never stored, only
/// a reference (for example `env:OPENAI_KEY_1`) that the bridge resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub id: String,
    pub secret_ref: String,
    pub quota_remaining: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_count: i64,
    pub consecutive_failures: i64,
    pub max_sessions: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub id: String,
    pub secret_ref: String,
    pub quota: i64,
    pub max_sessions: i64,
}

impl Database {
    /// Registers a credential. Re-registering an existing id refreshes its
    /// secret reference and session budget but keeps quota and cooldown state.
    pub async fn upsert_credential(&self, new: &NewCredential) -> Result<CredentialRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO credentials (
                id, secret_ref, quota_remaining, cooldown_until, failure_count,
                consecutive_failures, max_sessions, created_at, updated_at
            ) VALUES (?, ?, ?, NULL, 0, 0, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                secret_ref = excluded.secret_ref,
                max_sessions = excluded.max_sessions,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&new.id)
        .bind(&new.secret_ref)
        .bind(new.quota)
        .bind(new.max_sessions)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.fetch_credential(&new.id)
            .await?
            .ok_or_else(|| StoreError::CredentialNotFound(new.id.clone()).into())
    }

    pub async fn fetch_credential(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_credential).transpose()
    }

    pub async fn list_credentials(&self) -> Result<Vec<CredentialRecord>> {
        let mut rows = sqlx::query("SELECT * FROM credentials ORDER BY id ASC").fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_credential(row)?);
        }
        Ok(out)
    }

    /// Writes back the mutable bookkeeping columns of a credential.
    pub async fn save_credential_state(&self, record: &CredentialRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET quota_remaining = ?, cooldown_until = ?, failure_count = ?,
                consecutive_failures = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record.quota_remaining)
        .bind(record.cooldown_until.map(|ts| ts.to_rfc3339()))
        .bind(record.failure_count)
        .bind(record.consecutive_failures)
        .bind(Utc::now().to_rfc3339())
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CredentialNotFound(record.id.clone()).into());
        }
        Ok(())
    }
}

fn map_credential(row: SqliteRow) -> Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.try_get("id")?,
        secret_ref: row.try_get("secret_ref")?,
        quota_remaining: row.try_get("quota_remaining")?,
        cooldown_until: parse_optional_datetime(row.try_get("cooldown_until")?)?,
        failure_count: row.try_get("failure_count")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        max_sessions: row.try_get("max_sessions")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}
