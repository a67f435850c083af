use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
#[cfg(target_os = "linux")]
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::SandboxLimits;

/// Raw cgroup v2 counters consulted by the health check and usage reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupCounters {
    pub memory_current: Option<u64>,
    pub oom_kills: u64,
    pub nr_throttled: u64,
    pub pids_current: Option<u64>,
    pub cpu_usage_usec: Option<u64>,
}

/// Prepares a dedicated cgroup for the sandbox and applies its limits. On
/// any failure the group directory is removed again before the error is
/// returned.
#[cfg(target_os = "linux")]
pub async fn prepare_cgroup(root: &Path, sandbox_id: Uuid, limits: &SandboxLimits) -> Result<PathBuf> {
    let group_path = root.join(sandbox_id.to_string());
    fs::create_dir_all(&group_path)
        .await
        .with_context(|| format!("creating cgroup directory at {}", group_path.display()))?;

    if let Err(err) = apply_limits(&group_path, limits).await {
        if let Err(cleanup_err) = cleanup_cgroup(&group_path).await {
            tracing::warn!(
                path = %group_path.display(),
                error = %cleanup_err,
                "failed to remove partially configured cgroup"
            );
        }
        return Err(err);
    }

    Ok(group_path)
}

#[cfg(target_os = "linux")]
async fn apply_limits(group_path: &Path, limits: &SandboxLimits) -> Result<()> {
    write_string(group_path.join("memory.max"), limits.mem_cap_bytes.to_string()).await?;
    write_string(group_path.join("pids.max"), limits.max_processes.to_string()).await?;
    write_string(group_path.join("cpu.max"), cpu_quota_value(limits.cpu_millis)).await
}

/// Registers a process with its cgroup.
#[cfg(target_os = "linux")]
pub async fn add_pid_to_cgroup(group_path: &Path, pid: u32) -> Result<()> {
    write_string(group_path.join("cgroup.procs"), pid.to_string()).await
}

/// Kills every process still in the cgroup, including escaped descendants.
#[cfg(target_os = "linux")]
pub async fn kill_cgroup(group_path: &Path) -> Result<()> {
    match write_string(group_path.join("cgroup.kill"), "1".to_string()).await {
        Ok(()) => Ok(()),
        Err(err) if !group_path.exists() => {
            tracing::debug!(path = %group_path.display(), error = %err, "cgroup already gone");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn prepare_cgroup(
    _root: &Path,
    _sandbox_id: Uuid,
    _limits: &SandboxLimits,
) -> Result<PathBuf> {
    Err(anyhow::anyhow!("cgroups are only supported on Linux"))
}

#[cfg(not(target_os = "linux"))]
pub async fn add_pid_to_cgroup(_group_path: &Path, _pid: u32) -> Result<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub async fn kill_cgroup(_group_path: &Path) -> Result<()> {
    Ok(())
}

/// Removes the cgroup directory. The kernel refuses while member processes
/// are still exiting, so the removal is retried briefly.
///
/// cgroupfs answers `EBUSY`, never `ENOTEMPTY`; a non-empty directory means
/// the root is an ordinary directory and is removed recursively.
pub async fn cleanup_cgroup(group_path: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        match fs::remove_dir(group_path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                return fs::remove_dir_all(group_path)
                    .await
                    .with_context(|| format!("removing directory {}", group_path.display()));
            }
            Err(err) if attempt < 10 => {
                attempt += 1;
                tracing::trace!(path = %group_path.display(), error = %err, attempt, "cgroup busy");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("removing cgroup {}", group_path.display()))
            }
        }
    }
}

/// Synchronous best-effort variant used from rollback `Drop` paths.
pub fn cleanup_cgroup_blocking(group_path: &Path) {
    let _ = std::fs::write(group_path.join("cgroup.kill"), "1");
    let result = match std::fs::remove_dir(group_path) {
        Err(err) if err.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
            std::fs::remove_dir_all(group_path)
        }
        other => other,
    };
    if let Err(err) = result {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %group_path.display(), error = %err, "failed to remove cgroup during rollback");
        }
    }
}

/// Reads `memory.current`, `pids.current`, the `oom_kill` entry of
/// `memory.events` and the `usage_usec`/`nr_throttled` entries of `cpu.stat`.
/// Missing files read as absent/zero.
pub async fn read_counters(group_path: &Path) -> CgroupCounters {
    let memory_current = read_single(group_path.join("memory.current")).await;
    let pids_current = read_single(group_path.join("pids.current")).await;
    let oom_kills = fs::read_to_string(group_path.join("memory.events"))
        .await
        .ok()
        .and_then(|raw| keyed_value(&raw, "oom_kill"))
        .unwrap_or(0);
    let cpu_stat = fs::read_to_string(group_path.join("cpu.stat")).await.ok();
    let nr_throttled = cpu_stat
        .as_deref()
        .and_then(|raw| keyed_value(raw, "nr_throttled"))
        .unwrap_or(0);
    let cpu_usage_usec = cpu_stat
        .as_deref()
        .and_then(|raw| keyed_value(raw, "usage_usec"));

    CgroupCounters {
        memory_current,
        oom_kills,
        nr_throttled,
        pids_current,
        cpu_usage_usec,
    }
}

async fn read_single(path: PathBuf) -> Option<u64> {
    fs::read_to_string(path)
        .await
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

/// Parses a `key value` line out of a flat-keyed cgroup file.
fn keyed_value(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != key {
            return None;
        }
        parts.next()?.parse().ok()
    })
}

#[cfg(target_os = "linux")]
async fn write_string(path: PathBuf, value: String) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    file.write_all(value.as_bytes())
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn cpu_quota_value(cpu_millis: u32) -> String {
    // cgroup v2 uses "<quota> <period>" in microseconds; 1000 millis is one CPU.
    const PERIOD: u64 = 100_000;
    if cpu_millis == 0 {
        return "max".to_string();
    }

    let quota = ((cpu_millis as u64) * PERIOD) / 1000;
    format!("{} {}", quota.max(1), PERIOD)
}
