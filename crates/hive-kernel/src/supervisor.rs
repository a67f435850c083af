//! Creation, health checking and teardown of sandboxes.
//!
//! A sandbox bundles one isolation identity, one memory reservation against
//! the host budget, an optional cgroup v2 scope, a private working directory
//! and the agent host process. Partial allocations are rolled back by a guard
//! when creation fails; creation itself runs detached from its caller.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{oneshot, Semaphore},
    task::spawn_blocking,
};
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::{
    audit::{AuditEvent, AuditTrail},
    host::{IdentityPool, IsolationIdentity, MemoryBudget},
    isolation::{
        add_pid_to_cgroup, cleanup_cgroup, cleanup_cgroup_blocking, kill_cgroup, prepare_cgroup,
        read_counters, CgroupCounters,
    },
    runtime::{SandboxInstance, SandboxRuntime, SpawnRequest},
    sanitize_component, IsolationSettings, KernelConfig,
};

/// `memory.current` at or above this share of the cap reports `Degraded`.
const MEMORY_PRESSURE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SandboxLimits {
    pub mem_cap_bytes: u64,
    pub max_processes: u64,
    pub cpu_millis: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Running,
    Degraded,
    Dead,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedReason {
    MemoryNearCap { current_bytes: u64, cap_bytes: u64 },
    OomKilled { count: u64 },
    CpuThrottled { new_periods: u64 },
    WorkdirOverQuota { used_bytes: u64, quota_bytes: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reasons", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded(Vec<DegradedReason>),
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    Requested,
    Evicted,
    Lost,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Identity,
    Memory,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Identity => f.write_str("isolation identity pool"),
            ResourceKind::Memory => f.write_str("host memory budget"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("{0} exhausted")]
    ResourceExhausted(ResourceKind),
    #[error("sandbox {0} not found")]
    NotFound(Uuid),
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("sandbox runtime failed: {0}")]
    Runtime(String),
    #[error("failed to prepare workspace {path}: {message}")]
    Workspace { path: PathBuf, message: String },
    #[error("failed to apply resource limits: {0}")]
    Isolation(String),
}

/// Point-in-time view of a live sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub id: Uuid,
    pub owner_user_id: String,
    pub agent_id: String,
    pub identity: IsolationIdentity,
    pub state: SandboxState,
    pub workdir: PathBuf,
    pub cgroup: Option<PathBuf>,
    pub mem_cap_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Live resource usage of one sandbox next to its limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxUsage {
    pub sandbox_id: Uuid,
    /// `memory.current`; absent without a cgroup.
    pub memory_current_bytes: Option<u64>,
    pub memory_max_bytes: u64,
    pub resident_bytes: Option<u64>,
    pub pids_current: Option<u64>,
    pub pids_max: u64,
    pub cpu_usage_usec: Option<u64>,
    pub oom_kills: u64,
    pub workdir_bytes: u64,
    pub workdir_quota_bytes: Option<u64>,
}

impl SandboxUsage {
    pub fn over_quota(&self) -> bool {
        self.workdir_quota_bytes
            .map_or(false, |quota| self.workdir_bytes > quota)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SupervisorStats {
    pub live_sandboxes: usize,
    pub free_identities: usize,
    pub identity_capacity: usize,
    pub reserved_bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Clone)]
pub struct SandboxSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    runtime: Arc<dyn SandboxRuntime>,
    workspace_root: PathBuf,
    workdir_quota_bytes: Option<u64>,
    isolation: IsolationSettings,
    destroy_grace: Duration,
    identities: IdentityPool,
    memory: Arc<MemoryBudget>,
    workers: Semaphore,
    sandboxes: RwLock<HashMap<Uuid, Arc<SandboxEntry>>>,
    audit: AuditTrail,
    shutting_down: AtomicBool,
}

struct SandboxEntry {
    id: Uuid,
    owner_user_id: String,
    agent_id: String,
    identity: IsolationIdentity,
    limits: SandboxLimits,
    workdir: PathBuf,
    cgroup: Option<PathBuf>,
    instance: Arc<dyn SandboxInstance>,
    created_at: DateTime<Utc>,
    last_active_at: Mutex<DateTime<Utc>>,
    state: Mutex<SandboxState>,
    last_throttled: AtomicU64,
}

impl SandboxEntry {
    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id,
            owner_user_id: self.owner_user_id.clone(),
            agent_id: self.agent_id.clone(),
            identity: self.identity,
            state: *self.state.lock(),
            workdir: self.workdir.clone(),
            cgroup: self.cgroup.clone(),
            mem_cap_bytes: self.limits.mem_cap_bytes,
            created_at: self.created_at,
            last_active_at: *self.last_active_at.lock(),
        }
    }
}

impl SandboxSupervisor {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &KernelConfig, audit: AuditTrail) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                runtime,
                workspace_root: config.workspace_root.clone(),
                workdir_quota_bytes: config.workdir_quota_bytes,
                isolation: config.isolation.clone(),
                destroy_grace: config.destroy_grace,
                identities: IdentityPool::new(
                    config.identity.base_uid,
                    config.identity.base_gid,
                    config.pool_size,
                ),
                memory: Arc::new(MemoryBudget::new(config.host_memory_budget_bytes)),
                workers: Semaphore::new(config.worker_threads),
                sandboxes: RwLock::new(HashMap::new()),
                audit,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn memory_budget(&self) -> Arc<MemoryBudget> {
        self.inner.memory.clone()
    }

    /// Allocates identity, memory, cgroup and workdir, then launches the agent
    /// host.
    ///
    /// The work runs in its own task and always finishes: when the caller
    /// stops waiting, the sandbox is torn down as soon as it exists, so no
    /// filesystem or cgroup step is ever abandoned half way.
    #[instrument(skip(self, limits))]
    pub async fn create(
        &self,
        owner_user_id: &str,
        agent_id: &str,
        limits: SandboxLimits,
    ) -> Result<SandboxInfo, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        let supervisor = self.clone();
        let owner_user_id = owner_user_id.to_string();
        let agent_id = agent_id.to_string();
        tokio::spawn(
            async move {
                let result = supervisor
                    .create_inner(&owner_user_id, &agent_id, limits)
                    .await;
                if let Err(Ok(info)) = tx.send(result) {
                    debug!(sandbox_id = %info.id, "creation abandoned by caller; tearing down");
                    if let Err(err) = supervisor
                        .destroy_for(info.id, TeardownReason::Requested)
                        .await
                    {
                        warn!(sandbox_id = %info.id, error = %err, "failed to destroy abandoned sandbox");
                    }
                }
            }
            .in_current_span(),
        );

        rx.await
            .map_err(|_| SupervisorError::Runtime("sandbox creation task aborted".to_string()))?
    }

    async fn create_inner(
        &self,
        owner_user_id: &str,
        agent_id: &str,
        limits: SandboxLimits,
    ) -> Result<SandboxInfo, SupervisorError> {
        let inner = &self.inner;
        let _permit = inner
            .workers
            .acquire()
            .await
            .map_err(|_| SupervisorError::ShuttingDown)?;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(SupervisorError::ShuttingDown);
        }

        let id = Uuid::new_v4();
        let mut rollback = CreateRollback::new(inner.clone(), id);

        let identity = inner
            .identities
            .acquire()
            .ok_or(SupervisorError::ResourceExhausted(ResourceKind::Identity))?;
        rollback.identity = Some(identity);

        if !inner.memory.try_reserve(limits.mem_cap_bytes) {
            return Err(SupervisorError::ResourceExhausted(ResourceKind::Memory));
        }
        rollback.reserved_bytes = limits.mem_cap_bytes;

        // A sandbox never runs without the limits it was configured with.
        let cgroup = match (inner.isolation.enable_cgroups, inner.isolation.cgroup_root.as_ref()) {
            (true, Some(root)) => {
                let path = prepare_cgroup(root, id, &limits).await.map_err(|err| {
                    warn!(sandbox_id = %id, error = %err, "failed to initialize cgroup");
                    SupervisorError::Isolation(format!("{err:#}"))
                })?;
                rollback.cgroup = Some(path.clone());
                Some(path)
            }
            _ => None,
        };

        let workdir = inner
            .workspace_root
            .join(sanitize_component(owner_user_id))
            .join(id.to_string());
        rollback.workdir = Some(workdir.clone());
        prepare_workdir(
            workdir.clone(),
            identity,
            inner.isolation.assign_identity,
        )
        .await?;

        let request = SpawnRequest {
            sandbox_id: id,
            owner_user_id: owner_user_id.to_string(),
            agent_id: agent_id.to_string(),
            workdir: workdir.clone(),
            identity,
        };
        let instance = inner
            .runtime
            .spawn(&request)
            .await
            .map_err(|err| SupervisorError::Runtime(format!("{err:#}")))?;
        rollback.instance = Some(instance.clone());

        if let (Some(path), Some(pid)) = (cgroup.as_ref(), instance.pid()) {
            add_pid_to_cgroup(path, pid).await.map_err(|err| {
                warn!(sandbox_id = %id, error = %err, "failed to attach agent host to cgroup");
                SupervisorError::Isolation(format!("{err:#}"))
            })?;
        }

        let now = Utc::now();
        let entry = Arc::new(SandboxEntry {
            id,
            owner_user_id: owner_user_id.to_string(),
            agent_id: agent_id.to_string(),
            identity,
            limits,
            workdir,
            cgroup,
            instance,
            created_at: now,
            last_active_at: Mutex::new(now),
            state: Mutex::new(SandboxState::Running),
            last_throttled: AtomicU64::new(0),
        });
        {
            // `shutdown` raises the flag before it drains the map, so either
            // it sees this entry or this check sees the flag.
            let mut sandboxes = inner.sandboxes.write();
            if inner.shutting_down.load(Ordering::SeqCst) {
                return Err(SupervisorError::ShuttingDown);
            }
            sandboxes.insert(id, entry.clone());
        }
        rollback.disarm();

        info!(sandbox_id = %id, uid = identity.uid, "sandbox created");
        inner
            .audit
            .record(AuditEvent::sandbox_created(
                id,
                owner_user_id,
                agent_id,
                identity,
                limits.mem_cap_bytes,
            ))
            .await;
        Ok(entry.info())
    }

    /// Terminates and releases a sandbox. Destroying an unknown or already
    /// destroyed sandbox is a no-op.
    pub async fn destroy(&self, sandbox_id: Uuid) -> Result<(), SupervisorError> {
        self.destroy_for(sandbox_id, TeardownReason::Requested).await
    }

    #[instrument(skip(self))]
    pub async fn destroy_for(
        &self,
        sandbox_id: Uuid,
        reason: TeardownReason,
    ) -> Result<(), SupervisorError> {
        let Some(entry) = self.inner.sandboxes.write().remove(&sandbox_id) else {
            debug!(sandbox_id = %sandbox_id, "destroy of unknown sandbox ignored");
            return Ok(());
        };
        self.teardown(entry, reason).await;
        Ok(())
    }

    async fn teardown(&self, entry: Arc<SandboxEntry>, reason: TeardownReason) {
        let inner = &self.inner;
        // Teardown must complete even while shutdown closes the pool.
        let _permit = inner.workers.acquire().await.ok();

        if let Err(err) = entry.instance.terminate(inner.destroy_grace).await {
            warn!(sandbox_id = %entry.id, error = %err, "agent host termination failed");
        }

        if let Some(path) = entry.cgroup.as_ref() {
            if let Err(err) = kill_cgroup(path).await {
                warn!(sandbox_id = %entry.id, error = %err, "failed to kill cgroup members");
            }
            if let Err(err) = cleanup_cgroup(path).await {
                warn!(sandbox_id = %entry.id, error = %err, "failed to cleanup cgroup");
            }
        }

        if let Err(err) = wipe_workdir(entry.workdir.clone()).await {
            warn!(sandbox_id = %entry.id, error = %err, "failed to wipe sandbox workdir");
        }

        inner.memory.release(entry.limits.mem_cap_bytes);
        inner.identities.release(entry.identity);
        *entry.state.lock() = SandboxState::Destroyed;

        info!(sandbox_id = %entry.id, ?reason, "sandbox destroyed");
        inner
            .audit
            .record(AuditEvent::sandbox_torn_down(
                entry.id,
                &entry.owner_user_id,
                &entry.agent_id,
                reason,
            ))
            .await;
    }

    /// Inspects liveness and cgroup counters. A dead sandbox is destroyed
    /// before `Dead` is returned.
    pub async fn health_check(&self, sandbox_id: Uuid) -> Result<HealthStatus, SupervisorError> {
        let entry = self
            .entry(sandbox_id)
            .ok_or(SupervisorError::NotFound(sandbox_id))?;

        if !entry.instance.is_alive().await {
            warn!(sandbox_id = %sandbox_id, "agent host is no longer running");
            *entry.state.lock() = SandboxState::Dead;
            self.destroy_for(sandbox_id, TeardownReason::Lost).await?;
            return Ok(HealthStatus::Dead);
        }

        let mut reasons = Vec::new();
        if let Some(path) = entry.cgroup.as_ref() {
            let counters = read_counters(path).await;
            let cap = entry.limits.mem_cap_bytes;
            if let Some(current) = counters.memory_current {
                if current as f64 >= cap as f64 * MEMORY_PRESSURE_RATIO {
                    reasons.push(DegradedReason::MemoryNearCap {
                        current_bytes: current,
                        cap_bytes: cap,
                    });
                }
            }
            if counters.oom_kills > 0 {
                reasons.push(DegradedReason::OomKilled {
                    count: counters.oom_kills,
                });
            }
            let previous = entry
                .last_throttled
                .swap(counters.nr_throttled, Ordering::AcqRel);
            if counters.nr_throttled > previous {
                reasons.push(DegradedReason::CpuThrottled {
                    new_periods: counters.nr_throttled - previous,
                });
            }
        }

        if let Some(quota) = self.inner.workdir_quota_bytes {
            match workdir_size(entry.workdir.clone()).await {
                Ok(used) if used > quota => reasons.push(DegradedReason::WorkdirOverQuota {
                    used_bytes: used,
                    quota_bytes: quota,
                }),
                Ok(_) => {}
                Err(err) => {
                    debug!(sandbox_id = %sandbox_id, error = %err, "failed to measure workdir")
                }
            }
        }

        let mut state = entry.state.lock();
        if reasons.is_empty() {
            *state = SandboxState::Running;
            Ok(HealthStatus::Healthy)
        } else {
            *state = SandboxState::Degraded;
            Ok(HealthStatus::Degraded(reasons))
        }
    }

    /// Records activity. Returns false when the sandbox is not live.
    pub fn touch(&self, sandbox_id: Uuid) -> bool {
        match self.entry(sandbox_id) {
            Some(entry) => {
                *entry.last_active_at.lock() = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Current memory footprint: cgroup `memory.current`, else the agent
    /// host's RSS, else the cap.
    pub async fn footprint(&self, sandbox_id: Uuid) -> Option<u64> {
        let entry = self.entry(sandbox_id)?;
        if let Some(path) = entry.cgroup.as_ref() {
            if let Some(current) = read_counters(path).await.memory_current {
                return Some(current);
            }
        }
        Some(
            entry
                .instance
                .resident_bytes()
                .unwrap_or(entry.limits.mem_cap_bytes),
        )
    }

    /// Cgroup counters, RSS and working directory size of a live sandbox.
    pub async fn usage(&self, sandbox_id: Uuid) -> Result<SandboxUsage, SupervisorError> {
        let entry = self
            .entry(sandbox_id)
            .ok_or(SupervisorError::NotFound(sandbox_id))?;
        let counters = match entry.cgroup.as_ref() {
            Some(path) => read_counters(path).await,
            None => CgroupCounters::default(),
        };
        let workdir_bytes = workdir_size(entry.workdir.clone())
            .await
            .map_err(|err| SupervisorError::Workspace {
                path: entry.workdir.clone(),
                message: err.to_string(),
            })?;

        Ok(SandboxUsage {
            sandbox_id,
            memory_current_bytes: counters.memory_current,
            memory_max_bytes: entry.limits.mem_cap_bytes,
            resident_bytes: entry.instance.resident_bytes(),
            pids_current: counters.pids_current,
            pids_max: entry.limits.max_processes,
            cpu_usage_usec: counters.cpu_usage_usec,
            oom_kills: counters.oom_kills,
            workdir_bytes,
            workdir_quota_bytes: self.inner.workdir_quota_bytes,
        })
    }

    pub fn contains(&self, sandbox_id: Uuid) -> bool {
        self.inner.sandboxes.read().contains_key(&sandbox_id)
    }

    pub fn get(&self, sandbox_id: Uuid) -> Option<SandboxInfo> {
        self.entry(sandbox_id).map(|entry| entry.info())
    }

    pub fn snapshot(&self) -> Vec<SandboxInfo> {
        let mut out: Vec<_> = self
            .inner
            .sandboxes
            .read()
            .values()
            .map(|entry| entry.info())
            .collect();
        out.sort_by_key(|info| info.created_at);
        out
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            live_sandboxes: self.inner.sandboxes.read().len(),
            free_identities: self.inner.identities.available(),
            identity_capacity: self.inner.identities.capacity(),
            reserved_bytes: self.inner.memory.reserved(),
            budget_bytes: self.inner.memory.limit(),
        }
    }

    /// Refuses new sandboxes, destroys every live one and drains the pool.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<_> = self.inner.sandboxes.write().drain().map(|(_, e)| e).collect();
        let count = entries.len();
        futures::future::join_all(
            entries
                .into_iter()
                .map(|entry| self.teardown(entry, TeardownReason::Shutdown)),
        )
        .await;
        let leaked = self.inner.identities.drain();
        if leaked > 0 {
            warn!(leaked, "identities still checked out after shutdown");
        }
        info!(destroyed = count, "supervisor shut down");
    }

    fn entry(&self, sandbox_id: Uuid) -> Option<Arc<SandboxEntry>> {
        self.inner.sandboxes.read().get(&sandbox_id).cloned()
    }
}

/// Releases whatever a half-finished `create` acquired.
struct CreateRollback {
    inner: Arc<SupervisorInner>,
    sandbox_id: Uuid,
    armed: bool,
    identity: Option<IsolationIdentity>,
    reserved_bytes: u64,
    cgroup: Option<PathBuf>,
    workdir: Option<PathBuf>,
    instance: Option<Arc<dyn SandboxInstance>>,
}

impl CreateRollback {
    fn new(inner: Arc<SupervisorInner>, sandbox_id: Uuid) -> Self {
        Self {
            inner,
            sandbox_id,
            armed: true,
            identity: None,
            reserved_bytes: 0,
            cgroup: None,
            workdir: None,
            instance: None,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CreateRollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(sandbox_id = %self.sandbox_id, "rolling back partial sandbox creation");

        if let Some(instance) = self.instance.take() {
            instance.kill_now();
        }
        if let Some(path) = self.cgroup.take() {
            cleanup_cgroup_blocking(&path);
        }
        if let Some(path) = self.workdir.take() {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove workdir during rollback");
                }
            }
        }
        if self.reserved_bytes > 0 {
            self.inner.memory.release(self.reserved_bytes);
        }
        if let Some(identity) = self.identity.take() {
            self.inner.identities.release(identity);
        }
    }
}

async fn prepare_workdir(
    path: PathBuf,
    identity: IsolationIdentity,
    assign_identity: bool,
) -> Result<(), SupervisorError> {
    let display = path.clone();
    spawn_blocking(move || create_private_dir(&path, identity, assign_identity))
        .await
        .map_err(|err| err.to_string())
        .and_then(|result| result.map_err(|err| err.to_string()))
        .map_err(|message| SupervisorError::Workspace {
            path: display,
            message,
        })
}

fn create_private_dir(
    path: &Path,
    identity: IsolationIdentity,
    assign_identity: bool,
) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        if assign_identity {
            std::os::unix::fs::chown(path, Some(identity.uid), Some(identity.gid))?;
        }
    }
    #[cfg(not(unix))]
    let _ = (identity, assign_identity);

    Ok(())
}

/// Bytes of regular files below `path`. Symlinks are not followed.
async fn workdir_size(path: PathBuf) -> std::io::Result<u64> {
    spawn_blocking(move || {
        let mut total = 0;
        let mut pending = vec![path];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            for entry in entries {
                let entry = entry?;
                let metadata = entry.path().symlink_metadata()?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn wipe_workdir(path: PathBuf) -> std::io::Result<()> {
    spawn_blocking(move || match std::fs::remove_dir_all(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    })
    .await
    .map_err(std::io::Error::other)?
}
