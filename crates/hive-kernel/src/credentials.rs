//! Least-loaded leasing of upstream model credentials with failure cooldown.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use hive_store::{CredentialRecord, Database, NewCredential};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    /// Consecutive failures before a credential enters cooldown.
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random jitter added to each cooldown.
    pub max_jitter: Duration,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
            max_jitter: Duration::from_secs(5),
        }
    }
}

/// Operator-supplied definition of a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    pub id: String,
    pub secret_ref: String,
    pub quota: i64,
    pub max_sessions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialLease {
    pub credential_id: String,
    pub secret_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialSnapshot {
    pub id: String,
    pub secret_ref: String,
    pub quota_remaining: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_count: i64,
    pub consecutive_failures: i64,
    pub max_sessions: i64,
    pub active_leases: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no credential is currently available")]
    Exhausted,
    #[error("credential '{0}' is not registered")]
    UnknownCredential(String),
    #[error("credential storage failed: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for PoolError {
    fn from(value: anyhow::Error) -> Self {
        PoolError::Storage(format!("{value:#}"))
    }
}

#[derive(Clone)]
pub struct CredentialPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    db: Database,
    policy: CredentialPolicy,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    credentials: BTreeMap<String, CredentialEntry>,
    leases: HashMap<Uuid, String>,
}

struct CredentialEntry {
    record: CredentialRecord,
    sessions: HashSet<Uuid>,
}

impl CredentialEntry {
    fn eligible(&self, now: DateTime<Utc>) -> bool {
        self.record.quota_remaining > 0
            && self.record.cooldown_until.map_or(true, |until| until <= now)
            && (self.sessions.len() as i64) < self.record.max_sessions
    }

    fn snapshot(&self) -> CredentialSnapshot {
        CredentialSnapshot {
            id: self.record.id.clone(),
            secret_ref: self.record.secret_ref.clone(),
            quota_remaining: self.record.quota_remaining,
            cooldown_until: self.record.cooldown_until,
            failure_count: self.record.failure_count,
            consecutive_failures: self.record.consecutive_failures,
            max_sessions: self.record.max_sessions,
            active_leases: self.sessions.len(),
        }
    }
}

impl CredentialPool {
    /// Builds the pool from every credential already persisted.
    pub async fn load(db: Database, policy: CredentialPolicy) -> Result<Self> {
        let mut state = PoolState::default();
        for record in db.list_credentials().await? {
            state.credentials.insert(
                record.id.clone(),
                CredentialEntry {
                    record,
                    sessions: HashSet::new(),
                },
            );
        }
        info!(credentials = state.credentials.len(), "credential pool loaded");

        Ok(Self {
            inner: Arc::new(PoolInner {
                db,
                policy,
                state: Mutex::new(state),
            }),
        })
    }

    /// Adds a credential, or refreshes the secret reference and session budget
    /// of an existing one without touching its quota and cooldown.
    pub async fn register(&self, spec: CredentialSpec) -> Result<CredentialSnapshot, PoolError> {
        let mut state = self.inner.state.lock().await;
        let record = self
            .inner
            .db
            .upsert_credential(&NewCredential {
                id: spec.id.clone(),
                secret_ref: spec.secret_ref,
                quota: spec.quota,
                max_sessions: spec.max_sessions as i64,
            })
            .await?;

        let entry = state
            .credentials
            .entry(spec.id)
            .or_insert_with(|| CredentialEntry {
                record: record.clone(),
                sessions: HashSet::new(),
            });
        entry.record = record;
        Ok(entry.snapshot())
    }

    /// Leases the least-loaded eligible credential to a session. A session
    /// that already holds a lease gets the same one back. Never waits.
    pub async fn acquire(&self, session_id: Uuid) -> Result<CredentialLease, PoolError> {
        let mut state = self.inner.state.lock().await;
        if let Some(id) = state.leases.get(&session_id).cloned() {
            if let Some(entry) = state.credentials.get(&id) {
                return Ok(CredentialLease {
                    credential_id: id,
                    secret_ref: entry.record.secret_ref.clone(),
                });
            }
        }

        let now = Utc::now();
        let chosen = state
            .credentials
            .values()
            .filter(|entry| entry.eligible(now))
            .min_by_key(|entry| {
                (
                    entry.sessions.len(),
                    Reverse(entry.record.quota_remaining),
                    entry.record.id.clone(),
                )
            })
            .map(|entry| entry.record.id.clone())
            .ok_or(PoolError::Exhausted)?;

        let entry = state
            .credentials
            .get_mut(&chosen)
            .ok_or_else(|| PoolError::UnknownCredential(chosen.clone()))?;
        entry.sessions.insert(session_id);
        let lease = CredentialLease {
            credential_id: chosen.clone(),
            secret_ref: entry.record.secret_ref.clone(),
        };
        state.leases.insert(session_id, chosen);
        Ok(lease)
    }

    /// Returns the session's lease, if any. Returns the credential id released.
    pub async fn release(&self, session_id: Uuid) -> Option<String> {
        let mut state = self.inner.state.lock().await;
        let id = state.leases.remove(&session_id)?;
        if let Some(entry) = state.credentials.get_mut(&id) {
            entry.sessions.remove(&session_id);
        }
        Some(id)
    }

    /// Credential currently leased to a session.
    pub async fn lease_of(&self, session_id: Uuid) -> Option<String> {
        self.inner.state.lock().await.leases.get(&session_id).cloned()
    }

    /// Records an upstream failure; enough consecutive failures put the
    /// credential into exponential-backoff cooldown.
    pub async fn report_failure(&self, id: &str) -> Result<CredentialSnapshot, PoolError> {
        let policy = &self.inner.policy;
        self.update(id, |record| {
            record.failure_count += 1;
            record.consecutive_failures += 1;

            let threshold = policy.failure_threshold as i64;
            if record.consecutive_failures >= threshold {
                let backoff = cooldown_for(policy, record.consecutive_failures - threshold);
                let jitter_ms = if policy.max_jitter.is_zero() {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=policy.max_jitter.as_millis() as u64)
                };
                let total = backoff + Duration::from_millis(jitter_ms);
                let until = Utc::now()
                    + chrono::Duration::from_std(total)
                        .unwrap_or_else(|_| chrono::Duration::seconds(policy.max_backoff.as_secs() as i64));
                record.cooldown_until = Some(until);
                warn!(
                    credential_id = %record.id,
                    consecutive_failures = record.consecutive_failures,
                    cooldown_secs = total.as_secs(),
                    "credential entered cooldown"
                );
            }
        })
        .await
    }

    pub async fn report_success(&self, id: &str) -> Result<CredentialSnapshot, PoolError> {
        self.update(id, |record| record.consecutive_failures = 0).await
    }

    /// Resets the remaining quota.
    pub async fn replenish(&self, id: &str, quota: i64) -> Result<CredentialSnapshot, PoolError> {
        self.update(id, |record| record.quota_remaining = quota.max(0))
            .await
    }

    /// Consumes quota after upstream usage, never dropping below zero.
    pub async fn record_usage(&self, id: &str, amount: i64) -> Result<CredentialSnapshot, PoolError> {
        self.update(id, |record| {
            record.quota_remaining = (record.quota_remaining - amount.max(0)).max(0)
        })
        .await
    }

    pub async fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let state = self.inner.state.lock().await;
        state.credentials.values().map(CredentialEntry::snapshot).collect()
    }

    async fn update<F>(&self, id: &str, mutate: F) -> Result<CredentialSnapshot, PoolError>
    where
        F: FnOnce(&mut CredentialRecord),
    {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .credentials
            .get_mut(id)
            .ok_or_else(|| PoolError::UnknownCredential(id.to_string()))?;

        let mut updated = entry.record.clone();
        mutate(&mut updated);
        self.inner.db.save_credential_state(&updated).await?;
        entry.record = updated;
        Ok(entry.snapshot())
    }
}

/// `base * 2^exponent`, capped at `max_backoff`.
fn cooldown_for(policy: &CredentialPolicy, exponent: i64) -> Duration {
    let exponent = exponent.clamp(0, 30) as u32;
    policy
        .base_backoff
        .checked_mul(1u32 << exponent)
        .unwrap_or(policy.max_backoff)
        .min(policy.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CredentialPolicy {
        CredentialPolicy {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
            max_jitter: Duration::ZERO,
        }
    }

    fn spec(id: &str, quota: i64, max_sessions: u32) -> CredentialSpec {
        CredentialSpec {
            id: id.to_string(),
            secret_ref: format!("env:{}", id.to_uppercase()),
            quota,
            max_sessions,
        }
    }

    async fn pool() -> CredentialPool {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        CredentialPool::load(db, policy()).await.unwrap()
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        let policy = policy();
        assert_eq!(cooldown_for(&policy, 0), Duration::from_secs(10));
        assert_eq!(cooldown_for(&policy, 1), Duration::from_secs(20));
        assert_eq!(cooldown_for(&policy, 2), Duration::from_secs(40));
        assert_eq!(cooldown_for(&policy, 3), Duration::from_secs(60));
        assert_eq!(cooldown_for(&policy, 40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn least_loaded_credential_wins() {
        let pool = pool().await;
        pool.register(spec("key1", 10, 4)).await.unwrap();
        pool.register(spec("key2", 10, 4)).await.unwrap();

        let a = pool.acquire(Uuid::new_v4()).await.unwrap();
        let b = pool.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(a.credential_id, "key1");
        assert_eq!(b.credential_id, "key2");
    }

    #[tokio::test]
    async fn ties_prefer_larger_quota() {
        let pool = pool().await;
        pool.register(spec("key1", 5, 4)).await.unwrap();
        pool.register(spec("key2", 50, 4)).await.unwrap();

        let lease = pool.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(lease.credential_id, "key2");
    }

    #[tokio::test]
    async fn rate_budget_limits_concurrent_sessions() {
        let pool = pool().await;
        pool.register(spec("key1", 10, 1)).await.unwrap();

        let first = Uuid::new_v4();
        pool.acquire(first).await.unwrap();
        // Same session gets its lease back rather than a second slot.
        assert_eq!(pool.acquire(first).await.unwrap().credential_id, "key1");
        assert_eq!(
            pool.acquire(Uuid::new_v4()).await.unwrap_err(),
            PoolError::Exhausted
        );

        assert_eq!(pool.release(first).await.as_deref(), Some("key1"));
        pool.acquire(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_failures_trigger_cooldown_and_success_resets() {
        let pool = pool().await;
        pool.register(spec("key1", 10, 4)).await.unwrap();

        pool.report_failure("key1").await.unwrap();
        let snap = pool.report_failure("key1").await.unwrap();
        assert!(snap.cooldown_until.is_none());
        pool.report_success("key1").await.unwrap();

        for _ in 0..2 {
            pool.report_failure("key1").await.unwrap();
        }
        assert!(pool.acquire(Uuid::new_v4()).await.is_ok());

        let snap = pool.report_failure("key1").await.unwrap();
        assert_eq!(snap.failure_count, 5);
        assert_eq!(snap.consecutive_failures, 3);
        assert!(snap.cooldown_until.unwrap() > Utc::now());
        assert_eq!(
            pool.acquire(Uuid::new_v4()).await.unwrap_err(),
            PoolError::Exhausted
        );
    }

    #[tokio::test]
    async fn quota_usage_and_replenish() {
        let pool = pool().await;
        pool.register(spec("key1", 2, 4)).await.unwrap();

        let snap = pool.record_usage("key1", 5).await.unwrap();
        assert_eq!(snap.quota_remaining, 0);
        assert_eq!(
            pool.acquire(Uuid::new_v4()).await.unwrap_err(),
            PoolError::Exhausted
        );

        pool.replenish("key1", 100).await.unwrap();
        assert!(pool.acquire(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let pool = CredentialPool::load(db.clone(), policy()).await.unwrap();
        pool.register(spec("key1", 7, 4)).await.unwrap();
        pool.record_usage("key1", 2).await.unwrap();
        pool.report_failure("key1").await.unwrap();

        let reloaded = CredentialPool::load(db, policy()).await.unwrap();
        let snap = reloaded.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].quota_remaining, 5);
        assert_eq!(snap[0].failure_count, 1);
        assert_eq!(snap[0].active_leases, 0);
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let pool = pool().await;
        assert_eq!(
            pool.report_failure("nope").await.unwrap_err(),
            PoolError::UnknownCredential("nope".into())
        );
    }
}
