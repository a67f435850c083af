#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use hive_kernel::{
    CredentialSpec, HiveKernel, HostMemoryGauge, KernelConfig, SandboxInstance, SandboxRuntime,
    SpawnRequest,
};
use hive_store::Database;
use parking_lot::Mutex;
use tempfile::TempDir;

pub struct FakeInstance {
    alive: AtomicBool,
    resident: u64,
}

impl FakeInstance {
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxInstance for FakeInstance {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn resident_bytes(&self) -> Option<u64> {
        Some(self.resident)
    }

    async fn terminate(&self, _grace: Duration) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kill_now(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// In-memory runtime with a configurable spawn delay and footprint.
#[derive(Default)]
pub struct FakeRuntime {
    pub spawn_delay: Mutex<Duration>,
    pub resident_bytes: AtomicU64,
    spawned: AtomicUsize,
    instances: Mutex<Vec<Arc<FakeInstance>>>,
}

impl FakeRuntime {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn alive(&self) -> usize {
        self.instances
            .lock()
            .iter()
            .filter(|instance| instance.alive.load(Ordering::SeqCst))
            .count()
    }

    pub fn crash_all(&self) {
        for instance in self.instances.lock().iter() {
            instance.crash();
        }
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn spawn(&self, _request: &SpawnRequest) -> Result<Arc<dyn SandboxInstance>> {
        let delay = *self.spawn_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(FakeInstance {
            alive: AtomicBool::new(true),
            resident: self.resident_bytes.load(Ordering::SeqCst),
        });
        self.instances.lock().push(instance.clone());
        Ok(instance)
    }
}

/// Host free memory set by the test.
pub struct FixedGauge(pub AtomicU64);

impl HostMemoryGauge for FixedGauge {
    fn free_bytes(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub kernel: HiveKernel,
    pub runtime: Arc<FakeRuntime>,
    pub gauge: Arc<FixedGauge>,
    pub db: Database,
    _dir: TempDir,
}

pub fn test_config(root: &Path) -> KernelConfig {
    let mut config = KernelConfig {
        workspace_root: root.to_path_buf(),
        pool_size: 16,
        mem_cap_bytes: 1_000,
        host_memory_budget_bytes: 100_000,
        low_watermark_bytes: 0,
        high_watermark_bytes: 1,
        reuse_window: Duration::ZERO,
        destroy_grace: Duration::from_millis(10),
        sweep_interval: Duration::from_secs(3600),
        ..KernelConfig::default()
    };
    config.isolation.enable_cgroups = false;
    config.isolation.assign_identity = false;
    config
}

pub async fn harness_with(tweak: impl FnOnce(&mut KernelConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);

    let db = Database::connect("sqlite::memory:").await.unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    runtime.resident_bytes.store(400, Ordering::SeqCst);
    let gauge = Arc::new(FixedGauge(AtomicU64::new(u64::MAX / 2)));

    let kernel = HiveKernel::bootstrap(
        db.clone(),
        runtime.clone(),
        config,
        Some(gauge.clone() as Arc<dyn HostMemoryGauge>),
    )
    .await
    .unwrap();

    kernel
        .credentials
        .register(CredentialSpec {
            id: "primary".into(),
            secret_ref: "env:PRIMARY_KEY".into(),
            quota: 1_000,
            max_sessions: 8,
        })
        .await
        .unwrap();

    Harness {
        kernel,
        runtime,
        gauge,
        db,
        _dir: dir,
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}
