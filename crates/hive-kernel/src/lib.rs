//! Core Hive kernel: sandbox supervision, session lifecycle, idle reclamation,
//! credential leasing and the per-session message ledger.
//!
//! Sandboxes are runtime-only. Each one is a single agent host process running
//! under a dedicated uid/gid inside an optional cgroup v2 scope, with its own
//! private working directory. Everything that must outlive a sandbox (session
//! identity, credential bookkeeping, message history) lives in `hive-store`.

mod audit;
mod credentials;
mod host;
mod isolation;
mod ledger;
mod lifecycle;
mod reclaim;
mod runtime;
mod supervisor;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use hive_store::Database;
use tracing::info;

pub use audit::{verify_signed_line, AuditConfig, AuditEvent, AuditEventKind, AuditTrail};
pub use credentials::{
    CredentialLease, CredentialPolicy, CredentialPool, CredentialSnapshot, CredentialSpec,
    PoolError,
};
pub use host::{
    parse_mem_available, BudgetMemoryGauge, HostMemoryGauge, IdentityPool, IsolationIdentity,
    MemoryBudget, ProcMeminfoGauge,
};
pub use isolation::CgroupCounters;
pub use ledger::{MessageLedger, SyncBatch, MAX_SYNC_LIMIT};
pub use lifecycle::{
    LifecycleError, SessionDescriptor, SessionLifecycleManager, SessionSandbox, SessionStatus,
};
pub use reclaim::{eviction_score, ReclamationScheduler, SweepReport};
pub use runtime::{ProcessSandboxRuntime, SandboxInstance, SandboxRuntime, SpawnRequest};
pub use supervisor::{
    DegradedReason, HealthStatus, ResourceKind, SandboxInfo, SandboxLimits, SandboxState,
    SandboxSupervisor, SandboxUsage, SupervisorError, SupervisorStats, TeardownReason,
};

const MIB: u64 = 1024 * 1024;

/// Logical configuration driving the kernel behaviour.
///
/// The flat fields are the knobs operators tune most often; the grouped
/// settings below them rarely change between deployments.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Hard idle limit after which a sandbox is evicted regardless of pressure.
    pub idle_timeout: Duration,
    /// Memory cap applied to every sandbox and reserved against the host budget.
    pub mem_cap_bytes: u64,
    /// Size of the isolation identity pool, i.e. the max number of live sandboxes.
    pub pool_size: usize,
    pub low_watermark_bytes: u64,
    pub high_watermark_bytes: u64,
    /// Global memory budget sandboxes reserve against.
    pub host_memory_budget_bytes: u64,
    pub sweep_interval: Duration,
    /// Quiet period after which an `Active` session is demoted to `Idle`.
    pub active_grace: Duration,
    /// How long an ended session's sandbox is kept for cheap reuse.
    pub reuse_window: Duration,
    /// Grace period between SIGTERM and SIGKILL on teardown.
    pub destroy_grace: Duration,
    /// Concurrent supervisor operations (create/destroy).
    pub worker_threads: usize,
    pub workspace_root: PathBuf,
    /// Soft limit on a sandbox's working directory; exceeding it reports
    /// `Degraded`. `None` disables the check.
    pub workdir_quota_bytes: Option<u64>,
    pub identity: IdentityRange,
    pub process_limits: ProcessLimits,
    pub isolation: IsolationSettings,
    pub audit: AuditConfig,
    pub credentials: CredentialPolicy,
    pub loss_alert: LossAlertSettings,
}

impl KernelConfig {
    /// Limits handed to the supervisor for every new sandbox.
    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            mem_cap_bytes: self.mem_cap_bytes,
            max_processes: self.process_limits.max_processes,
            cpu_millis: self.process_limits.cpu_millis,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.mem_cap_bytes == 0 {
            bail!("mem_cap_bytes must be greater than zero");
        }
        if self.mem_cap_bytes > self.host_memory_budget_bytes {
            bail!(
                "mem_cap_bytes ({}) exceeds host_memory_budget_bytes ({})",
                self.mem_cap_bytes,
                self.host_memory_budget_bytes
            );
        }
        if self.high_watermark_bytes <= self.low_watermark_bytes {
            bail!(
                "high_watermark_bytes ({}) must be greater than low_watermark_bytes ({})",
                self.high_watermark_bytes,
                self.low_watermark_bytes
            );
        }
        if self.idle_timeout.is_zero() {
            bail!("idle_timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep_interval must be greater than zero");
        }
        if self.active_grace >= self.idle_timeout {
            bail!("active_grace must be shorter than idle_timeout");
        }
        let last_uid = self.identity.base_uid as u64 + self.pool_size as u64;
        let last_gid = self.identity.base_gid as u64 + self.pool_size as u64;
        if last_uid > u32::MAX as u64 || last_gid > u32::MAX as u64 {
            bail!("identity range overflows u32 for pool_size {}", self.pool_size);
        }
        if self.isolation.agent_command.trim().is_empty() {
            bail!("agent_command must not be empty");
        }
        if self.workdir_quota_bytes == Some(0) {
            bail!("workdir_quota_bytes must be greater than zero when set");
        }
        if self.credentials.failure_threshold == 0 {
            bail!("credential failure_threshold must be at least 1");
        }
        if self.credentials.max_backoff < self.credentials.base_backoff {
            bail!("credential max_backoff must not be shorter than base_backoff");
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            mem_cap_bytes: 64 * MIB,
            pool_size: 2_000,
            low_watermark_bytes: 1024 * MIB,
            high_watermark_bytes: 2048 * MIB,
            host_memory_budget_bytes: 16 * 1024 * MIB,
            sweep_interval: Duration::from_secs(30),
            active_grace: Duration::from_secs(120),
            reuse_window: Duration::from_secs(30),
            destroy_grace: Duration::from_secs(5),
            worker_threads: 8,
            workspace_root: PathBuf::from("./.hive_workspaces"),
            workdir_quota_bytes: None,
            identity: IdentityRange::default(),
            process_limits: ProcessLimits::default(),
            isolation: IsolationSettings::default(),
            audit: AuditConfig::default(),
            credentials: CredentialPolicy::default(),
            loss_alert: LossAlertSettings::default(),
        }
    }
}

/// First uid/gid handed out; identity `i` of the pool is `(base_uid + i, base_gid + i)`.
#[derive(Debug, Clone, Copy)]
pub struct IdentityRange {
    pub base_uid: u32,
    pub base_gid: u32,
}

impl Default for IdentityRange {
    fn default() -> Self {
        Self {
            base_uid: 200_000,
            base_gid: 200_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub max_processes: u64,
    /// CPU share in millicores (1000 = one CPU). Zero leaves cpu.max unlimited.
    pub cpu_millis: u32,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            max_processes: 64,
            cpu_millis: 500,
        }
    }
}

/// Configures how the runtime applies host isolation primitives.
#[derive(Debug, Clone)]
pub struct IsolationSettings {
    pub enable_cgroups: bool,
    pub cgroup_root: Option<PathBuf>,
    /// Run the agent under its pool uid/gid. Requires the daemon to hold
    /// CAP_SETUID/CAP_SETGID.
    pub assign_identity: bool,
    pub agent_command: String,
    pub agent_args: Vec<String>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            enable_cgroups: true,
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/hive")),
            assign_identity: true,
            agent_command: "hive-agent-host".to_string(),
            agent_args: Vec::new(),
        }
    }
}

/// Threshold for warning operators about agents whose sandboxes keep dying.
#[derive(Debug, Clone, Copy)]
pub struct LossAlertSettings {
    pub threshold: u32,
    pub window: Duration,
}

impl Default for LossAlertSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(10 * 60),
        }
    }
}

/// Fully wired kernel services sharing one database and one supervisor.
#[derive(Clone)]
pub struct HiveKernel {
    pub supervisor: SandboxSupervisor,
    pub credentials: CredentialPool,
    pub ledger: MessageLedger,
    pub lifecycle: SessionLifecycleManager,
    pub scheduler: ReclamationScheduler,
}

impl HiveKernel {
    /// Validates the config, recovers persisted sessions from a previous run
    /// and loads credential state. When `gauge` is `None` host free memory is
    /// read from `/proc/meminfo`, falling back to the memory budget.
    pub async fn bootstrap(
        db: Database,
        runtime: Arc<dyn SandboxRuntime>,
        config: KernelConfig,
        gauge: Option<Arc<dyn HostMemoryGauge>>,
    ) -> Result<Self> {
        config.validate()?;

        let audit = AuditTrail::from_config(&config.audit);
        let supervisor = SandboxSupervisor::new(runtime, &config, audit.clone());
        let credentials = CredentialPool::load(db.clone(), config.credentials.clone()).await?;
        let ledger = MessageLedger::new(db.clone());
        let lifecycle = SessionLifecycleManager::new(
            db,
            supervisor.clone(),
            credentials.clone(),
            ledger.clone(),
            &config,
            audit,
        );

        let recovered = lifecycle.recover().await?;
        if recovered > 0 {
            info!(sessions = recovered, "terminated sessions left live by previous run");
        }

        let gauge = gauge.unwrap_or_else(|| {
            Arc::new(ProcMeminfoGauge::new(supervisor.memory_budget())) as Arc<dyn HostMemoryGauge>
        });
        let scheduler =
            ReclamationScheduler::new(lifecycle.clone(), supervisor.clone(), gauge, &config);

        Ok(Self {
            supervisor,
            credentials,
            ledger,
            lifecycle,
            scheduler,
        })
    }
}

pub(crate) fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
