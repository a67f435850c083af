use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use crate::{parse_datetime, parse_optional_datetime, parse_uuid, Database, StoreError};

/// Lifecycle state of a session, persisted as snake_case text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Active,
    Idle,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Terminated => "terminated",
        }
    }

    /// States in which the session expects a live sandbox behind it.
    pub fn holds_sandbox(&self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Active | SessionState::Idle
        )
    }
}

impl FromStr for SessionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uninitialized" => Ok(SessionState::Uninitialized),
            "initializing" => Ok(SessionState::Initializing),
            "ready" => Ok(SessionState::Ready),
            "active" => Ok(SessionState::Active),
            "idle" => Ok(SessionState::Idle),
            "terminated" => Ok(SessionState::Terminated),
            other => Err(StoreError::InvalidValue {
                field: "session state",
                value: other.to_string(),
            }
            .into()),
        }
    }
}

/// Why a session last entered `Terminated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Ended,
    Evicted,
    SandboxLost,
    HostRestart,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Evicted => "evicted",
            EndReason::SandboxLost => "sandbox_lost",
            EndReason::HostRestart => "host_restart",
        }
    }
}

impl FromStr for EndReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ended" => Ok(EndReason::Ended),
            "evicted" => Ok(EndReason::Evicted),
            "sandbox_lost" => Ok(EndReason::SandboxLost),
            "host_restart" => Ok(EndReason::HostRestart),
            other => Err(anyhow!("unknown end reason: {}", other)),
        }
    }
}

/// Persisted session row. `sandbox_id` is a weak reference: the sandbox may be
/// gone while the session (and its history) lives on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    pub state: SessionState,
    pub sandbox_id: Option<Uuid>,
    pub credential_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_sync_seq: i64,
    pub end_reason: Option<EndReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable columns written back after a lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub state: SessionState,
    pub sandbox_id: Option<Uuid>,
    pub credential_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl Database {
    /// Returns the session for a (user, agent) pair, creating it in
    /// `Uninitialized` state on first use. Safe under concurrent callers.
    pub async fn ensure_session(&self, user_id: &str, agent_id: &str) -> Result<SessionRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sessions (
                id, user_id, agent_id, state, last_sync_seq, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(agent_id)
        .bind(SessionState::Uninitialized.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.fetch_session_by_pair(user_id, agent_id)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "session inserted but missing when reloaded (user={}, agent={})",
                    user_id,
                    agent_id
                )
            })
    }

    pub async fn fetch_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_session).transpose()
    }

    pub async fn fetch_session_by_pair(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE user_id = ? AND agent_id = ?")
            .bind(user_id)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_session).transpose()
    }

    /// Lists every session ordered by creation time.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at ASC").fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_session(row)?);
        }
        Ok(out)
    }

    pub async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let mut rows = sqlx::query("SELECT * FROM sessions WHERE user_id = ? ORDER BY created_at ASC")
            .bind(user_id)
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_session(row)?);
        }
        Ok(out)
    }

    /// Writes the lifecycle columns of a session.
    pub async fn update_session(&self, id: Uuid, update: &SessionUpdate) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET state = ?, sandbox_id = ?, credential_id = ?, started_at = ?,
                heartbeat_at = ?, end_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.state.as_str())
        .bind(update.sandbox_id.map(|id| id.to_string()))
        .bind(update.credential_id.as_deref())
        .bind(update.started_at.map(|ts| ts.to_rfc3339()))
        .bind(update.heartbeat_at.map(|ts| ts.to_rfc3339()))
        .bind(update.end_reason.map(|reason| reason.as_str()))
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(id).into());
        }
        Ok(())
    }

    /// Raises the recorded sync high-water mark; never lowers it.
    pub async fn raise_last_sync_seq(&self, id: Uuid, seq: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET last_sync_seq = MAX(last_sync_seq, ?), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(seq)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks every session that claimed a live sandbox as terminated. Used at
    /// startup because sandbox runtime state never survives a restart.
    pub async fn terminate_live_sessions(&self, reason: EndReason) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET state = ?, sandbox_id = NULL, credential_id = NULL, end_reason = ?, updated_at = ?
            WHERE state IN ('initializing', 'ready', 'active', 'idle')
            "#,
        )
        .bind(SessionState::Terminated.as_str())
        .bind(reason.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn map_session(row: SqliteRow) -> Result<SessionRecord> {
    let id: String = row.try_get("id")?;
    let state: String = row.try_get("state")?;

    Ok(SessionRecord {
        id: parse_uuid(&id)?,
        user_id: row.try_get("user_id")?,
        agent_id: row.try_get("agent_id")?,
        state: SessionState::from_str(&state)?,
        sandbox_id: row
            .try_get::<Option<String>, _>("sandbox_id")?
            .map(|raw| parse_uuid(&raw))
            .transpose()?,
        credential_id: row.try_get("credential_id")?,
        started_at: parse_optional_datetime(row.try_get("started_at")?)?,
        heartbeat_at: parse_optional_datetime(row.try_get("heartbeat_at")?)?,
        last_sync_seq: row.try_get("last_sync_seq")?,
        end_reason: row
            .try_get::<Option<String>, _>("end_reason")?
            .map(|raw| EndReason::from_str(&raw))
            .transpose()?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}
