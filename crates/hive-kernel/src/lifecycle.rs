//! Per-(user, agent) session state machine on top of the supervisor and the
//! credential pool.
//!
//! Every session has one async mutex; all transitions of that session run
//! under it, so transitions are linearized per session while different
//! sessions proceed in parallel. Sandbox creation runs in a spawned task whose
//! result is a shared future: concurrent `init` calls for the same pair await
//! the same build.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use hive_store::{
    Database, EndReason, MessageRecord, MessageRole, SessionRecord, SessionState, SessionUpdate,
    StoreError,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::{sync::Mutex as AsyncMutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEvent, AuditTrail},
    credentials::{CredentialPool, PoolError},
    ledger::{MessageLedger, SyncBatch},
    supervisor::{
        HealthStatus, SandboxLimits, SandboxSupervisor, SandboxUsage, SupervisorError,
        TeardownReason,
    },
    KernelConfig, LossAlertSettings,
};

/// How many times `submit` re-drives a session that changed under it.
const MAX_REHYDRATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    pub sandbox_id: Option<Uuid>,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub user_id: String,
    pub agent_id: String,
    pub state: SessionState,
    pub sandbox_id: Option<Uuid>,
    pub credential_id: Option<String>,
    pub heartbeat_age_ms: Option<u64>,
    pub last_sync_seq: i64,
    pub end_reason: Option<EndReason>,
}

/// A session currently backed by a live sandbox, as seen by the reclamation sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSandbox {
    pub session_id: Uuid,
    pub sandbox_id: Uuid,
    pub state: SessionState,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    #[error("host resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("sandbox of session {0} was lost; initialize the session again")]
    SandboxLost(Uuid),
    #[error("no upstream credential is available")]
    CredentialUnavailable,
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("cannot {action} session {session_id} in state {state:?}")]
    InvalidTransition {
        session_id: Uuid,
        state: SessionState,
        action: &'static str,
    },
    #[error("sandbox creation for session {0} was cancelled")]
    Cancelled(Uuid),
    #[error("sandbox failure: {0}")]
    Sandbox(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<SupervisorError> for LifecycleError {
    fn from(value: SupervisorError) -> Self {
        match value {
            SupervisorError::ResourceExhausted(kind) => {
                LifecycleError::ResourceExhausted(kind.to_string())
            }
            other => LifecycleError::Sandbox(other.to_string()),
        }
    }
}

fn storage_error(err: anyhow::Error) -> LifecycleError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::SessionNotFound(id)) => LifecycleError::NotFound(*id),
        _ => LifecycleError::Storage(format!("{err:#}")),
    }
}

type BuildFuture = Shared<BoxFuture<'static, Result<SessionDescriptor, LifecycleError>>>;

struct InFlightBuild {
    generation: u64,
    cancel: CancellationToken,
    future: BuildFuture,
}

/// Sandbox of an ended session, kept until the reuse window closes.
struct ParkedSandbox {
    sandbox_id: Uuid,
    teardown: CancellationToken,
}

struct SessionRuntime {
    record: SessionRecord,
    last_activity: DateTime<Utc>,
    generation: u64,
    build: Option<InFlightBuild>,
    parked: Option<ParkedSandbox>,
}

impl SessionRuntime {
    fn new(record: SessionRecord) -> Self {
        let last_activity = record.heartbeat_at.unwrap_or(record.updated_at);
        Self {
            record,
            last_activity,
            generation: 0,
            build: None,
            parked: None,
        }
    }

    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.record.id,
            user_id: self.record.user_id.clone(),
            agent_id: self.record.agent_id.clone(),
            sandbox_id: self.record.sandbox_id,
            state: self.record.state,
        }
    }

    fn status(&self) -> SessionStatus {
        let heartbeat_age_ms = self
            .record
            .heartbeat_at
            .map(|at| (Utc::now() - at).num_milliseconds().max(0) as u64);
        SessionStatus {
            session_id: self.record.id,
            user_id: self.record.user_id.clone(),
            agent_id: self.record.agent_id.clone(),
            state: self.record.state,
            sandbox_id: self.record.sandbox_id,
            credential_id: self.record.credential_id.clone(),
            heartbeat_age_ms,
            last_sync_seq: self.record.last_sync_seq,
            end_reason: self.record.end_reason,
        }
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.record.state,
            SessionState::Terminated | SessionState::Uninitialized
        ) && self.build.is_none()
            && self.parked.is_none()
    }

    fn invalid(&self, action: &'static str) -> LifecycleError {
        LifecycleError::InvalidTransition {
            session_id: self.record.id,
            state: self.record.state,
            action,
        }
    }
}

type SessionSlot = Arc<AsyncMutex<SessionRuntime>>;

/// Counts sandbox losses per agent inside a sliding window.
struct LossTracker {
    settings: LossAlertSettings,
    losses: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl LossTracker {
    /// Records a loss; returns the count in the window once it reaches the threshold.
    fn record(&self, agent_id: &str) -> Option<u32> {
        let now = Instant::now();
        let mut losses = self.losses.lock();
        let entries = losses.entry(agent_id.to_string()).or_default();
        entries.push_back(now);
        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) > self.settings.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        let count = entries.len() as u32;
        let window = self.settings.window;
        losses.retain(|_, entries| {
            entries
                .back()
                .map_or(false, |latest| now.duration_since(*latest) <= window)
        });
        (count >= self.settings.threshold).then_some(count)
    }

    #[cfg(test)]
    fn tracked_agents(&self) -> usize {
        self.losses.lock().len()
    }
}

#[derive(Clone)]
pub struct SessionLifecycleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    db: Database,
    supervisor: SandboxSupervisor,
    credentials: CredentialPool,
    ledger: MessageLedger,
    limits: SandboxLimits,
    active_grace: Duration,
    reuse_window: Duration,
    audit: AuditTrail,
    sessions: Mutex<HashMap<Uuid, SessionSlot>>,
    losses: LossTracker,
}

impl SessionLifecycleManager {
    pub fn new(
        db: Database,
        supervisor: SandboxSupervisor,
        credentials: CredentialPool,
        ledger: MessageLedger,
        config: &KernelConfig,
        audit: AuditTrail,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                db,
                supervisor,
                credentials,
                ledger,
                limits: config.sandbox_limits(),
                active_grace: config.active_grace,
                reuse_window: config.reuse_window,
                audit,
                sessions: Mutex::new(HashMap::new()),
                losses: LossTracker {
                    settings: config.loss_alert,
                    losses: Mutex::new(HashMap::new()),
                },
            }),
        }
    }

    /// Ensures a sandbox backs the (user, agent) session. Concurrent calls for
    /// the same pair share one in-flight creation.
    #[instrument(skip(self))]
    pub async fn init(&self, user_id: &str, agent_id: &str) -> Result<SessionDescriptor, LifecycleError> {
        let record = self
            .inner
            .db
            .ensure_session(user_id, agent_id)
            .await
            .map_err(storage_error)?;
        let slot = self.slot_for_record(record);

        let pending = {
            let mut rt = slot.lock().await;
            match rt.record.state {
                SessionState::Ready | SessionState::Active | SessionState::Idle => {
                    match rt.record.sandbox_id {
                        Some(sandbox_id) if self.inner.supervisor.contains(sandbox_id) => {
                            return Ok(rt.descriptor());
                        }
                        missing => {
                            self.mark_lost(&mut rt, missing).await?;
                            self.begin_build(&mut rt).await?
                        }
                    }
                }
                SessionState::Initializing => {
                    let in_flight = rt.build.as_ref().map(|build| build.future.clone());
                    match in_flight {
                        Some(future) => future,
                        None => self.begin_build(&mut rt).await?,
                    }
                }
                SessionState::Uninitialized | SessionState::Terminated => {
                    if let Some(descriptor) = self.revive_parked(&mut rt).await? {
                        return Ok(descriptor);
                    }
                    self.begin_build(&mut rt).await?
                }
            }
        };

        pending.await
    }

    /// `Ready`/`Idle` to `Active`: health-checks the sandbox and leases a credential.
    #[instrument(skip(self))]
    pub async fn start(&self, session_id: Uuid) -> Result<SessionDescriptor, LifecycleError> {
        let slot = self.slot(session_id).await?;
        let mut rt = slot.lock().await;

        let from = rt.record.state;
        match from {
            SessionState::Active => {
                self.record_activity(&mut rt).await?;
                return Ok(rt.descriptor());
            }
            SessionState::Ready | SessionState::Idle => {}
            _ => return Err(rt.invalid("start")),
        }

        let Some(sandbox_id) = rt.record.sandbox_id else {
            self.mark_lost(&mut rt, None).await?;
            return Err(LifecycleError::SandboxLost(session_id));
        };

        match self.inner.supervisor.health_check(sandbox_id).await {
            Ok(HealthStatus::Healthy) => {}
            Ok(HealthStatus::Degraded(reasons)) => {
                warn!(session_id = %session_id, sandbox_id = %sandbox_id, ?reasons, "starting session on degraded sandbox");
            }
            Ok(HealthStatus::Dead) | Err(SupervisorError::NotFound(_)) => {
                self.mark_lost(&mut rt, Some(sandbox_id)).await?;
                return Err(LifecycleError::SandboxLost(session_id));
            }
            Err(err) => return Err(err.into()),
        }

        let lease = self
            .inner
            .credentials
            .acquire(session_id)
            .await
            .map_err(|err| match err {
                PoolError::Exhausted => LifecycleError::CredentialUnavailable,
                other => LifecycleError::Storage(other.to_string()),
            })?;

        let now = Utc::now();
        rt.record.credential_id = Some(lease.credential_id.clone());
        rt.record.state = SessionState::Active;
        if from == SessionState::Ready {
            rt.record.started_at = Some(now);
        }
        rt.record.heartbeat_at = Some(now);
        rt.last_activity = now;
        self.inner.supervisor.touch(sandbox_id);
        self.persist(&rt).await?;

        info!(session_id = %session_id, credential_id = %lease.credential_id, "session active");
        self.inner
            .audit
            .record(AuditEvent::session_started(
                session_id,
                &rt.record.user_id,
                &rt.record.agent_id,
                Some(sandbox_id),
                Some(lease.credential_id),
            ))
            .await;
        Ok(rt.descriptor())
    }

    pub async fn status(&self, session_id: Uuid) -> Result<SessionStatus, LifecycleError> {
        let slot = self.slot(session_id).await?;
        let rt = slot.lock().await;
        Ok(rt.status())
    }

    /// Terminates the session and releases its credential. The sandbox is
    /// parked for the reuse window before it is destroyed; an in-flight
    /// creation is cancelled. Ending a terminated session is a no-op.
    #[instrument(skip(self))]
    pub async fn end(&self, session_id: Uuid) -> Result<SessionStatus, LifecycleError> {
        let slot = self.slot(session_id).await?;
        let mut rt = slot.lock().await;

        match rt.record.state {
            SessionState::Terminated => return Ok(rt.status()),
            SessionState::Uninitialized => return Err(rt.invalid("end")),
            _ => {}
        }

        if let Some(build) = rt.build.take() {
            debug!(session_id = %session_id, "cancelling in-flight sandbox creation");
            build.cancel.cancel();
        }
        self.inner.credentials.release(session_id).await;
        rt.record.credential_id = None;
        if let Some(sandbox_id) = rt.record.sandbox_id.take() {
            self.park(&mut rt, sandbox_id).await;
        }
        rt.record.state = SessionState::Terminated;
        rt.record.end_reason = Some(EndReason::Ended);
        self.persist(&rt).await?;

        info!(session_id = %session_id, "session ended");
        self.inner
            .audit
            .record(AuditEvent::session_ended(
                session_id,
                &rt.record.user_id,
                &rt.record.agent_id,
                EndReason::Ended.as_str(),
            ))
            .await;
        let status = rt.status();
        self.forget_if_settled(&slot, &rt);
        Ok(status)
    }

    /// Records activity from the user or the bridge; revives `Idle` to `Active`.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<SessionStatus, LifecycleError> {
        let slot = self.slot(session_id).await?;
        let mut rt = slot.lock().await;

        if !rt.record.state.holds_sandbox() {
            return Err(rt.invalid("heartbeat"));
        }
        let sandbox_id = rt.record.sandbox_id;
        if !sandbox_id.map_or(false, |id| self.inner.supervisor.contains(id)) {
            self.mark_lost(&mut rt, sandbox_id).await?;
            return Err(LifecycleError::SandboxLost(session_id));
        }

        self.record_activity(&mut rt).await?;
        Ok(rt.status())
    }

    /// Resource usage of the session's sandbox. Does not count as activity.
    pub async fn resources(&self, session_id: Uuid) -> Result<SandboxUsage, LifecycleError> {
        let slot = self.slot(session_id).await?;
        let mut rt = slot.lock().await;

        if !rt.record.state.holds_sandbox() {
            return Err(rt.invalid("inspect"));
        }
        let Some(sandbox_id) = rt.record.sandbox_id else {
            self.mark_lost(&mut rt, None).await?;
            return Err(LifecycleError::SandboxLost(session_id));
        };
        match self.inner.supervisor.usage(sandbox_id).await {
            Ok(usage) => Ok(usage),
            Err(SupervisorError::NotFound(_)) => {
                self.mark_lost(&mut rt, Some(sandbox_id)).await?;
                Err(LifecycleError::SandboxLost(session_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// User-facing message path: brings the session back to `Active`
    /// (re-initializing a terminated session) and appends to the ledger.
    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        session_id: Uuid,
        role: MessageRole,
        payload: JsonValue,
    ) -> Result<MessageRecord, LifecycleError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ensure_active(session_id).await {
                Ok(()) => break,
                Err(
                    LifecycleError::SandboxLost(_)
                    | LifecycleError::InvalidTransition { .. }
                    | LifecycleError::Cancelled(_),
                ) if attempt < MAX_REHYDRATE_ATTEMPTS => {
                    debug!(session_id = %session_id, attempt, "session changed during rehydration; retrying");
                }
                Err(err) => return Err(err),
            }
        }

        self.inner
            .ledger
            .append(session_id, role, &payload)
            .await
            .map_err(storage_error)
    }

    /// Bridge-side append. Does not change session state beyond recording activity.
    pub async fn append(
        &self,
        session_id: Uuid,
        role: MessageRole,
        payload: JsonValue,
    ) -> Result<MessageRecord, LifecycleError> {
        let record = self
            .inner
            .ledger
            .append(session_id, role, &payload)
            .await
            .map_err(storage_error)?;

        if let Some(slot) = self.cached_slot(session_id) {
            let mut rt = slot.lock().await;
            if matches!(rt.record.state, SessionState::Active | SessionState::Idle) {
                self.record_activity(&mut rt).await?;
            }
        }
        Ok(record)
    }

    /// Incremental sync; remembers the highest delivered seq.
    pub async fn sync_since(
        &self,
        session_id: Uuid,
        known_seq: i64,
        limit: u32,
    ) -> Result<SyncBatch, LifecycleError> {
        let slot = self.slot(session_id).await?;
        let batch = self
            .inner
            .ledger
            .sync_since(session_id, known_seq, limit)
            .await
            .map_err(storage_error)?;

        if let Some(last) = batch.last_seq() {
            self.inner
                .db
                .raise_last_sync_seq(session_id, last)
                .await
                .map_err(storage_error)?;
            let mut rt = slot.lock().await;
            rt.record.last_sync_seq = rt.record.last_sync_seq.max(last);
        }
        Ok(batch)
    }

    /// Marks sessions a previous process left live as terminated. Sandboxes
    /// never survive a restart.
    pub async fn recover(&self) -> Result<u64, LifecycleError> {
        let count = self
            .inner
            .db
            .terminate_live_sessions(EndReason::HostRestart)
            .await
            .map_err(storage_error)?;
        self.inner.sessions.lock().clear();
        Ok(count)
    }

    /// Sessions currently backed by a sandbox. Sessions busy in a transition
    /// are skipped.
    pub fn live_sessions(&self) -> Vec<SessionSandbox> {
        let slots: Vec<SessionSlot> = self.inner.sessions.lock().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| {
                let rt = slot.try_lock().ok()?;
                if !rt.record.state.holds_sandbox() {
                    return None;
                }
                Some(SessionSandbox {
                    session_id: rt.record.id,
                    sandbox_id: rt.record.sandbox_id?,
                    state: rt.record.state,
                    last_activity: rt.last_activity,
                })
            })
            .collect()
    }

    /// Terminates a session whose sandbox was found dead. Returns false when
    /// the session has since moved to another sandbox.
    pub async fn handle_sandbox_death(
        &self,
        session_id: Uuid,
        sandbox_id: Uuid,
    ) -> Result<bool, LifecycleError> {
        let Some(slot) = self.cached_slot(session_id) else {
            return Ok(false);
        };
        let mut rt = slot.lock().await;
        if rt.record.sandbox_id != Some(sandbox_id) || !rt.record.state.holds_sandbox() {
            return Ok(false);
        }
        self.mark_lost(&mut rt, Some(sandbox_id)).await?;
        self.forget_if_settled(&slot, &rt);
        Ok(true)
    }

    /// `Active` to `Idle` when no activity was seen for the active grace period.
    pub async fn demote_if_quiet(&self, session_id: Uuid) -> Result<bool, LifecycleError> {
        let Some(slot) = self.cached_slot(session_id) else {
            return Ok(false);
        };
        let mut rt = slot.lock().await;
        if rt.record.state != SessionState::Active {
            return Ok(false);
        }
        let quiet = (Utc::now() - rt.last_activity)
            .to_std()
            .map_or(false, |elapsed| elapsed >= self.inner.active_grace);
        if !quiet {
            return Ok(false);
        }
        rt.record.state = SessionState::Idle;
        self.persist(&rt).await?;
        debug!(session_id = %session_id, "session idle");
        Ok(true)
    }

    /// Evicts the session's sandbox if nothing changed since the sweep's
    /// snapshot: same sandbox, still idle (or never started), no new activity.
    pub async fn evict_if_idle(
        &self,
        session_id: Uuid,
        sandbox_id: Uuid,
        observed_activity: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        let Some(slot) = self.cached_slot(session_id) else {
            return Ok(false);
        };
        let mut rt = slot.lock().await;
        let unchanged = matches!(rt.record.state, SessionState::Idle | SessionState::Ready)
            && rt.record.sandbox_id == Some(sandbox_id)
            && rt.last_activity == observed_activity;
        if !unchanged {
            debug!(session_id = %session_id, "session changed since snapshot; not evicting");
            return Ok(false);
        }

        self.inner.credentials.release(session_id).await;
        rt.record.credential_id = None;
        rt.record.sandbox_id = None;
        rt.record.state = SessionState::Terminated;
        rt.record.end_reason = Some(EndReason::Evicted);
        self.inner
            .supervisor
            .destroy_for(sandbox_id, TeardownReason::Evicted)
            .await?;
        self.persist(&rt).await?;

        info!(session_id = %session_id, sandbox_id = %sandbox_id, "idle sandbox evicted");
        self.inner
            .audit
            .record(AuditEvent::session_ended(
                session_id,
                &rt.record.user_id,
                &rt.record.agent_id,
                EndReason::Evicted.as_str(),
            ))
            .await;
        self.forget_if_settled(&slot, &rt);
        Ok(true)
    }

    async fn ensure_active(&self, session_id: Uuid) -> Result<(), LifecycleError> {
        let (state, user_id, agent_id) = {
            let slot = self.slot(session_id).await?;
            let rt = slot.lock().await;
            (
                rt.record.state,
                rt.record.user_id.clone(),
                rt.record.agent_id.clone(),
            )
        };

        match state {
            SessionState::Active | SessionState::Idle => self.heartbeat(session_id).await.map(|_| ()),
            SessionState::Ready => self.start(session_id).await.map(|_| ()),
            SessionState::Uninitialized | SessionState::Initializing | SessionState::Terminated => {
                debug!(session_id = %session_id, ?state, "rehydrating session");
                self.init(&user_id, &agent_id).await?;
                self.start(session_id).await.map(|_| ())
            }
        }
    }

    async fn begin_build(&self, rt: &mut SessionRuntime) -> Result<BuildFuture, LifecycleError> {
        let fallback = if rt.record.state == SessionState::Terminated {
            SessionState::Terminated
        } else {
            SessionState::Uninitialized
        };

        rt.generation += 1;
        let generation = rt.generation;
        rt.record.state = SessionState::Initializing;
        rt.record.sandbox_id = None;
        rt.record.end_reason = None;
        self.persist(rt).await?;

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let session_id = rt.record.id;
        let user_id = rt.record.user_id.clone();
        let agent_id = rt.record.agent_id.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            manager
                .build(session_id, user_id, agent_id, generation, token, fallback)
                .await
        });

        let future = async move {
            handle.await.unwrap_or_else(|err| {
                Err(LifecycleError::Sandbox(format!("sandbox build task failed: {err}")))
            })
        }
        .boxed()
        .shared();

        rt.build = Some(InFlightBuild {
            generation,
            cancel,
            future: future.clone(),
        });
        Ok(future)
    }

    async fn build(
        self,
        session_id: Uuid,
        user_id: String,
        agent_id: String,
        generation: u64,
        cancel: CancellationToken,
        fallback: SessionState,
    ) -> Result<SessionDescriptor, LifecycleError> {
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(session_id = %session_id, "sandbox creation cancelled before completion");
                return Err(LifecycleError::Cancelled(session_id));
            }
            result = self.inner.supervisor.create(&user_id, &agent_id, self.inner.limits) => result,
        };

        let Some(slot) = self.cached_slot(session_id) else {
            if let Ok(info) = created {
                self.discard_sandbox(info.id).await;
            }
            return Err(LifecycleError::Cancelled(session_id));
        };

        let mut rt = slot.lock().await;
        let still_wanted = !cancel.is_cancelled()
            && rt.build.as_ref().map(|build| build.generation) == Some(generation);
        if !still_wanted {
            drop(rt);
            if let Ok(info) = created {
                self.discard_sandbox(info.id).await;
            }
            return Err(LifecycleError::Cancelled(session_id));
        }
        rt.build = None;

        match created {
            Ok(info) => {
                rt.record.state = SessionState::Ready;
                rt.record.sandbox_id = Some(info.id);
                rt.last_activity = Utc::now();
                if let Err(err) = self.persist(&rt).await {
                    rt.record.state = fallback;
                    rt.record.sandbox_id = None;
                    drop(rt);
                    self.discard_sandbox(info.id).await;
                    return Err(err);
                }
                info!(session_id = %session_id, sandbox_id = %info.id, "session ready");
                Ok(rt.descriptor())
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "sandbox creation failed");
                rt.record.state = fallback;
                if let Err(persist_err) = self.persist(&rt).await {
                    warn!(session_id = %session_id, error = %persist_err, "failed to persist session after creation failure");
                }
                Err(err.into())
            }
        }
    }

    async fn discard_sandbox(&self, sandbox_id: Uuid) {
        if let Err(err) = self.inner.supervisor.destroy(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, error = %err, "failed to discard unneeded sandbox");
        }
    }

    async fn revive_parked(
        &self,
        rt: &mut SessionRuntime,
    ) -> Result<Option<SessionDescriptor>, LifecycleError> {
        let Some(parked) = rt.parked.take() else {
            return Ok(None);
        };
        parked.teardown.cancel();
        if !self.inner.supervisor.contains(parked.sandbox_id) {
            return Ok(None);
        }

        rt.record.state = SessionState::Ready;
        rt.record.sandbox_id = Some(parked.sandbox_id);
        rt.record.end_reason = None;
        rt.last_activity = Utc::now();
        self.inner.supervisor.touch(parked.sandbox_id);
        self.persist(rt).await?;
        info!(session_id = %rt.record.id, sandbox_id = %parked.sandbox_id, "reusing parked sandbox");
        Ok(Some(rt.descriptor()))
    }

    /// Keeps an ended session's sandbox alive for the reuse window.
    async fn park(&self, rt: &mut SessionRuntime, sandbox_id: Uuid) {
        if self.inner.reuse_window.is_zero() {
            self.discard_sandbox(sandbox_id).await;
            return;
        }

        let teardown = CancellationToken::new();
        rt.parked = Some(ParkedSandbox {
            sandbox_id,
            teardown: teardown.clone(),
        });

        let manager = self.clone();
        let session_id = rt.record.id;
        let window = self.inner.reuse_window;
        tokio::spawn(async move {
            tokio::select! {
                _ = teardown.cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }
            manager.expire_parked(session_id, sandbox_id).await;
        });
    }

    async fn expire_parked(&self, session_id: Uuid, sandbox_id: Uuid) {
        let Some(slot) = self.cached_slot(session_id) else {
            self.discard_sandbox(sandbox_id).await;
            return;
        };
        let mut rt = slot.lock().await;
        if rt.parked.as_ref().map(|parked| parked.sandbox_id) != Some(sandbox_id) {
            return;
        }
        rt.parked = None;
        debug!(session_id = %session_id, sandbox_id = %sandbox_id, "reuse window closed");
        self.discard_sandbox(sandbox_id).await;
        self.forget_if_settled(&slot, &rt);
    }

    async fn record_activity(&self, rt: &mut SessionRuntime) -> Result<(), LifecycleError> {
        let now = Utc::now();
        if rt.record.state == SessionState::Idle {
            rt.record.state = SessionState::Active;
        }
        rt.record.heartbeat_at = Some(now);
        rt.last_activity = now;
        if let Some(sandbox_id) = rt.record.sandbox_id {
            self.inner.supervisor.touch(sandbox_id);
        }
        self.persist(rt).await
    }

    /// Force-terminates a session whose sandbox died or disappeared.
    async fn mark_lost(
        &self,
        rt: &mut SessionRuntime,
        sandbox_id: Option<Uuid>,
    ) -> Result<(), LifecycleError> {
        let session_id = rt.record.id;
        self.inner.credentials.release(session_id).await;
        rt.record.credential_id = None;
        rt.record.sandbox_id = None;
        rt.record.state = SessionState::Terminated;
        rt.record.end_reason = Some(EndReason::SandboxLost);
        if let Some(id) = sandbox_id {
            self.inner
                .supervisor
                .destroy_for(id, TeardownReason::Lost)
                .await?;
        }
        self.persist(rt).await?;

        warn!(session_id = %session_id, sandbox_id = ?sandbox_id, agent_id = %rt.record.agent_id, "sandbox lost");
        self.inner
            .audit
            .record(AuditEvent::session_ended(
                session_id,
                &rt.record.user_id,
                &rt.record.agent_id,
                EndReason::SandboxLost.as_str(),
            ))
            .await;

        if let Some(losses) = self.inner.losses.record(&rt.record.agent_id) {
            let window = self.inner.losses.settings.window;
            warn!(
                agent_id = %rt.record.agent_id,
                losses,
                window_secs = window.as_secs(),
                "agent repeatedly losing sandboxes"
            );
            self.inner
                .audit
                .record(AuditEvent::repeated_loss(
                    &rt.record.agent_id,
                    &rt.record.user_id,
                    losses,
                    window.as_secs(),
                ))
                .await;
        }
        Ok(())
    }

    async fn persist(&self, rt: &SessionRuntime) -> Result<(), LifecycleError> {
        let record = &rt.record;
        self.inner
            .db
            .update_session(
                record.id,
                &SessionUpdate {
                    state: record.state,
                    sandbox_id: record.sandbox_id,
                    credential_id: record.credential_id.clone(),
                    started_at: record.started_at,
                    heartbeat_at: record.heartbeat_at,
                    end_reason: record.end_reason,
                },
            )
            .await
            .map_err(storage_error)
    }

    fn cached_slot(&self, session_id: Uuid) -> Option<SessionSlot> {
        self.inner.sessions.lock().get(&session_id).cloned()
    }

    /// Drops the in-memory slot of a terminated session that has nothing left
    /// in flight. The persisted record is authoritative and reloads on demand.
    /// Slots are only cloned under the map lock, so a count of two (map plus
    /// the caller's) means nobody else can be waiting on it.
    fn forget_if_settled(&self, slot: &SessionSlot, rt: &SessionRuntime) {
        if !rt.is_settled() {
            return;
        }
        let mut sessions = self.inner.sessions.lock();
        let ours = sessions
            .get(&rt.record.id)
            .map_or(false, |cached| Arc::ptr_eq(cached, slot));
        if ours && Arc::strong_count(slot) == 2 {
            sessions.remove(&rt.record.id);
        }
    }

    /// Drops every cached slot of a settled session nobody is using. Returns
    /// how many were dropped.
    pub fn forget_settled(&self) -> usize {
        let mut sessions = self.inner.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(rt) => !rt.is_settled(),
                Err(_) => true,
            }
        });
        before - sessions.len()
    }

    /// Number of sessions with an in-memory slot.
    pub fn cached_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    fn slot_for_record(&self, record: SessionRecord) -> SessionSlot {
        self.inner
            .sessions
            .lock()
            .entry(record.id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(SessionRuntime::new(record))))
            .clone()
    }

    async fn slot(&self, session_id: Uuid) -> Result<SessionSlot, LifecycleError> {
        if let Some(slot) = self.cached_slot(session_id) {
            return Ok(slot);
        }
        let record = self
            .inner
            .db
            .fetch_session(session_id)
            .await
            .map_err(storage_error)?
            .ok_or(LifecycleError::NotFound(session_id))?;
        Ok(self.slot_for_record(record))
    }
}
