use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use hive_store::{Database, MessageRecord, MessageRole};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Upper bound on messages returned by a single sync call.
pub const MAX_SYNC_LIMIT: u32 = 100;

/// One page of incremental sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncBatch {
    pub session_id: Uuid,
    pub messages: Vec<MessageRecord>,
    /// Latest seq stored for the session at read time.
    pub high_water: i64,
    pub has_more: bool,
}

impl SyncBatch {
    /// Highest seq delivered in this batch.
    pub fn last_seq(&self) -> Option<i64> {
        self.messages.last().map(|message| message.seq)
    }
}

/// Append-only per-session message log backed by the store.
#[derive(Clone)]
pub struct MessageLedger {
    db: Database,
    writers: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl MessageLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Appends with the next seq of the session. Appends to one session are
    /// serialized; different sessions proceed in parallel.
    pub async fn append(
        &self,
        session_id: Uuid,
        role: MessageRole,
        payload: &JsonValue,
    ) -> Result<MessageRecord> {
        let writer = self
            .writers
            .lock()
            .entry(session_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let result = {
            let _guard = writer.lock().await;
            self.db.append_message(session_id, role, payload).await
        };

        // Clones are only taken under the map lock, so a count of two (map
        // plus ours) means no other append is queued on this session.
        let mut writers = self.writers.lock();
        if Arc::strong_count(&writer) == 2 {
            writers.remove(&session_id);
        }
        result
    }

    /// Messages with `seq > known_seq` in order. `limit` is clamped to
    /// `1..=MAX_SYNC_LIMIT`.
    pub async fn sync_since(&self, session_id: Uuid, known_seq: i64, limit: u32) -> Result<SyncBatch> {
        let limit = limit.clamp(1, MAX_SYNC_LIMIT);
        let known_seq = known_seq.max(0);
        let messages = self
            .db
            .list_messages_after(session_id, known_seq, limit as i64)
            .await?;
        let high_water = self.db.latest_seq(session_id).await?;
        let delivered = messages.last().map_or(known_seq, |message| message.seq);

        Ok(SyncBatch {
            session_id,
            messages,
            high_water,
            has_more: delivered < high_water,
        })
    }

    pub async fn latest_seq(&self, session_id: Uuid) -> Result<i64> {
        self.db.latest_seq(session_id).await
    }

    /// Latest seq of every session of a user that has messages.
    pub async fn counts_for_user(&self, user_id: &str) -> Result<HashMap<Uuid, i64>> {
        self.db.latest_seqs_for_user(user_id).await
    }
}
