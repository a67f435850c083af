use std::{cmp::Ordering, sync::Arc, time::Duration};

use chrono::Utc;
use hive_store::SessionState;
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    host::HostMemoryGauge,
    lifecycle::{SessionLifecycleManager, SessionSandbox},
    supervisor::{HealthStatus, SandboxSupervisor, SupervisorError},
    KernelConfig,
};

const IDLE_WEIGHT: f64 = 0.7;
const FOOTPRINT_WEIGHT: f64 = 0.3;

/// Eviction priority in `0.0..=1.0`; higher is evicted first.
pub fn eviction_score(idle: Duration, footprint: u64, idle_timeout: Duration, mem_cap: u64) -> f64 {
    let idle_part = if idle_timeout.is_zero() {
        1.0
    } else {
        (idle.as_secs_f64() / idle_timeout.as_secs_f64()).min(1.0)
    };
    let footprint_part = if mem_cap == 0 {
        1.0
    } else {
        (footprint as f64 / mem_cap as f64).min(1.0)
    };
    IDLE_WEIGHT * idle_part + FOOTPRINT_WEIGHT * footprint_part
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Another sweep was still running.
    pub skipped: bool,
    pub lost: usize,
    pub demoted: usize,
    pub evicted_idle: usize,
    pub evicted_pressure: usize,
    pub free_bytes_before: u64,
    pub projected_free_bytes: u64,
}

struct Candidate {
    session: SessionSandbox,
    idle: Duration,
    footprint: u64,
    score: f64,
}

/// Periodic idle and memory-pressure reclamation over live sessions.
#[derive(Clone)]
pub struct ReclamationScheduler {
    lifecycle: SessionLifecycleManager,
    supervisor: SandboxSupervisor,
    gauge: Arc<dyn HostMemoryGauge>,
    idle_timeout: Duration,
    mem_cap_bytes: u64,
    low_watermark_bytes: u64,
    high_watermark_bytes: u64,
    interval: Duration,
    running: Arc<Mutex<()>>,
}

impl ReclamationScheduler {
    pub fn new(
        lifecycle: SessionLifecycleManager,
        supervisor: SandboxSupervisor,
        gauge: Arc<dyn HostMemoryGauge>,
        config: &KernelConfig,
    ) -> Self {
        Self {
            lifecycle,
            supervisor,
            gauge,
            idle_timeout: config.idle_timeout,
            mem_cap_bytes: config.mem_cap_bytes,
            low_watermark_bytes: config.low_watermark_bytes,
            high_watermark_bytes: config.high_watermark_bytes,
            interval: config.sweep_interval,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Runs the sweep every `sweep_interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("reclamation scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if report.lost + report.evicted_idle + report.evicted_pressure > 0 {
                            info!(
                                lost = report.lost,
                                demoted = report.demoted,
                                evicted_idle = report.evicted_idle,
                                evicted_pressure = report.evicted_pressure,
                                free_bytes = report.free_bytes_before,
                                "reclamation sweep finished"
                            );
                        }
                    }
                }
            }
        })
    }

    /// One pass: health checks, demotion, hard idle eviction and, under
    /// memory pressure, score-ordered eviction until the high watermark is
    /// projected to be reached.
    pub async fn sweep(&self) -> SweepReport {
        let Ok(_running) = self.running.try_lock() else {
            debug!("reclamation sweep already in progress");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };

        let mut report = SweepReport::default();

        for session in self.lifecycle.live_sessions() {
            let dead = match self.supervisor.health_check(session.sandbox_id).await {
                Ok(HealthStatus::Dead) | Err(SupervisorError::NotFound(_)) => true,
                Ok(HealthStatus::Degraded(reasons)) => {
                    debug!(session_id = %session.session_id, ?reasons, "sandbox degraded");
                    false
                }
                Ok(HealthStatus::Healthy) => false,
                Err(err) => {
                    warn!(session_id = %session.session_id, error = %err, "sandbox health check failed");
                    false
                }
            };
            if !dead {
                continue;
            }
            match self
                .lifecycle
                .handle_sandbox_death(session.session_id, session.sandbox_id)
                .await
            {
                Ok(true) => report.lost += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(session_id = %session.session_id, error = %err, "failed to record sandbox loss")
                }
            }
        }

        for session in self.lifecycle.live_sessions() {
            if session.state != SessionState::Active {
                continue;
            }
            match self.lifecycle.demote_if_quiet(session.session_id).await {
                Ok(true) => report.demoted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(session_id = %session.session_id, error = %err, "failed to demote session")
                }
            }
        }

        let now = Utc::now();
        let mut candidates = Vec::new();
        for session in self.lifecycle.live_sessions() {
            if !matches!(session.state, SessionState::Idle | SessionState::Ready) {
                continue;
            }
            let idle = (now - session.last_activity).to_std().unwrap_or_default();
            let footprint = self
                .supervisor
                .footprint(session.sandbox_id)
                .await
                .unwrap_or(self.mem_cap_bytes);
            let score = eviction_score(idle, footprint, self.idle_timeout, self.mem_cap_bytes);
            candidates.push(Candidate {
                session,
                idle,
                footprint,
                score,
            });
        }

        let free_before = self.gauge.free_bytes();
        report.free_bytes_before = free_before;
        let mut projected = free_before;

        let mut remaining = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.idle < self.idle_timeout {
                remaining.push(candidate);
                continue;
            }
            if self.evict(&candidate).await {
                report.evicted_idle += 1;
                projected = projected.saturating_add(candidate.footprint);
            }
        }

        if free_before < self.low_watermark_bytes {
            remaining.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            for candidate in &remaining {
                if projected >= self.high_watermark_bytes {
                    break;
                }
                if self.evict(candidate).await {
                    report.evicted_pressure += 1;
                    projected = projected.saturating_add(candidate.footprint);
                }
            }
            if projected < self.high_watermark_bytes {
                warn!(
                    projected_free_bytes = projected,
                    high_watermark_bytes = self.high_watermark_bytes,
                    "memory pressure persists after evicting every idle sandbox"
                );
            }
        }

        report.projected_free_bytes = projected;

        let forgotten = self.lifecycle.forget_settled();
        if forgotten > 0 {
            debug!(forgotten, "dropped cached state of settled sessions");
        }
        report
    }

    async fn evict(&self, candidate: &Candidate) -> bool {
        let session = &candidate.session;
        match self
            .lifecycle
            .evict_if_idle(session.session_id, session.sandbox_id, session.last_activity)
            .await
        {
            Ok(evicted) => {
                if evicted {
                    debug!(
                        session_id = %session.session_id,
                        score = candidate.score,
                        footprint = candidate.footprint,
                        "sandbox evicted"
                    );
                }
                evicted
            }
            Err(err) => {
                warn!(session_id = %session.session_id, error = %err, "sandbox eviction failed");
                false
            }
        }
    }
}
