use std::{collections::HashMap, str::FromStr};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use crate::{parse_datetime, parse_uuid, Database, StoreError};

/// Author of a ledger entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

impl FromStr for MessageRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            other => Err(anyhow!("unknown message role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub session_id: Uuid,
    pub seq: i64,
    pub role: MessageRole,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Database {
    /// Appends a message with the next sequence number for its session.
    ///
    /// Sequence allocation and insert are one statement, so SQLite takes the
    /// write lock up front and concurrent writers on other connections queue
    /// behind `busy_timeout` instead of failing a lock upgrade. The
    /// `(session_id, seq)` primary key still rejects duplicates.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        payload: &JsonValue,
    ) -> Result<MessageRecord> {
        let created_at = Utc::now();

        // No row comes back when the session does not exist.
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (session_id, seq, role, payload, created_at)
            SELECT s.id, COALESCE(MAX(m.seq), 0) + 1, ?, ?, ?
            FROM sessions s
            LEFT JOIN messages m ON m.session_id = s.id
            WHERE s.id = ?
            GROUP BY s.id
            RETURNING seq
            "#,
        )
        .bind(role.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(created_at.to_rfc3339())
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let seq = seq.ok_or(StoreError::SessionNotFound(session_id))?;

        Ok(MessageRecord {
            session_id,
            seq,
            role,
            payload: payload.clone(),
            created_at,
        })
    }

    /// Returns up to `limit` messages with `seq > after`, in ascending order.
    pub async fn list_messages_after(
        &self,
        session_id: Uuid,
        after: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE session_id = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(session_id.to_string())
        .bind(after)
        .bind(limit)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_message(row)?);
        }
        Ok(out)
    }

    /// Highest sequence number stored for a session, 0 when empty.
    pub async fn latest_seq(&self, session_id: Uuid) -> Result<i64> {
        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM messages WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(current.unwrap_or(0))
    }

    /// Latest sequence number per session of a user, keyed by session id.
    /// Sessions without messages are omitted.
    pub async fn latest_seqs_for_user(&self, user_id: &str) -> Result<HashMap<Uuid, i64>> {
        let mut rows = sqlx::query(
            r#"
            SELECT m.session_id AS session_id, MAX(m.seq) AS latest
            FROM messages m
            JOIN sessions s ON s.id = m.session_id
            WHERE s.user_id = ?
            GROUP BY m.session_id
            "#,
        )
        .bind(user_id)
        .fetch(&self.pool);

        let mut out = HashMap::new();
        while let Some(row) = rows.try_next().await? {
            let session_id: String = row.try_get("session_id")?;
            let latest: i64 = row.try_get("latest")?;
            out.insert(parse_uuid(&session_id)?, latest);
        }
        Ok(out)
    }
}

fn map_message(row: SqliteRow) -> Result<MessageRecord> {
    let session_id: String = row.try_get("session_id")?;
    let role: String = row.try_get("role")?;
    let payload: String = row.try_get("payload")?;

    Ok(MessageRecord {
        session_id: parse_uuid(&session_id)?,
        seq: row.try_get("seq")?,
        role: MessageRole::from_str(&role)?,
        payload: serde_json::from_str(&payload)?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sequence_numbers_are_dense_per_session() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let a = db.ensure_session("alice", "a").await.unwrap();
        let b = db.ensure_session("alice", "b").await.unwrap();

        for i in 0..3 {
            db.append_message(a.id, MessageRole::User, &json!({ "n": i }))
                .await
                .unwrap();
        }
        let first_b = db
            .append_message(b.id, MessageRole::Assistant, &json!("hi"))
            .await
            .unwrap();

        assert_eq!(first_b.seq, 1);
        assert_eq!(db.latest_seq(a.id).await.unwrap(), 3);

        let page = db.list_messages_after(a.id, 1, 10).await.unwrap();
        let seqs: Vec<_> = page.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(page[0].payload, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn concurrent_appends_across_sessions_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect_file(&dir.path().join("ledger.db"))
            .await
            .unwrap();

        let mut sessions = Vec::new();
        for i in 0..16 {
            sessions.push(db.ensure_session(&format!("user-{i}"), "agent").await.unwrap().id);
        }

        let mut handles = Vec::new();
        for round in 0..5 {
            for session_id in &sessions {
                let db = db.clone();
                let session_id = *session_id;
                handles.push(tokio::spawn(async move {
                    db.append_message(session_id, MessageRole::Assistant, &json!(round))
                        .await
                }));
            }
        }

        let mut per_session: HashMap<Uuid, Vec<i64>> = HashMap::new();
        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            per_session.entry(record.session_id).or_default().push(record.seq);
        }

        assert_eq!(per_session.len(), sessions.len());
        for (session_id, mut seqs) in per_session {
            seqs.sort_unstable();
            assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
            assert_eq!(db.latest_seq(session_id).await.unwrap(), 5);
        }
    }

    #[tokio::test]
    async fn appending_to_unknown_session_fails() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let missing = Uuid::new_v4();
        let err = db
            .append_message(missing, MessageRole::User, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::SessionNotFound(missing))
        );
    }

    #[tokio::test]
    async fn latest_seqs_cover_only_the_users_sessions() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let mine = db.ensure_session("carol", "a").await.unwrap();
        let empty = db.ensure_session("carol", "b").await.unwrap();
        let theirs = db.ensure_session("dave", "a").await.unwrap();

        db.append_message(mine.id, MessageRole::User, &json!(1))
            .await
            .unwrap();
        db.append_message(mine.id, MessageRole::Assistant, &json!(2))
            .await
            .unwrap();
        db.append_message(theirs.id, MessageRole::User, &json!(1))
            .await
            .unwrap();

        let seqs = db.latest_seqs_for_user("carol").await.unwrap();
        assert_eq!(seqs.get(&mine.id), Some(&2));
        assert!(!seqs.contains_key(&empty.id));
        assert!(!seqs.contains_key(&theirs.id));
    }
}
