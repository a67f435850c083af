//! The seam between the supervisor and whatever actually hosts an agent.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, warn};
use uuid::Uuid;
use which::which;

use crate::{IsolationIdentity, IsolationSettings};

/// Everything a runtime needs to launch the agent host for one sandbox.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub sandbox_id: Uuid,
    pub owner_user_id: String,
    pub agent_id: String,
    pub workdir: PathBuf,
    pub identity: IsolationIdentity,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn SandboxInstance>>;
}

#[async_trait]
pub trait SandboxInstance: Send + Sync + 'static {
    /// Pid of the agent host, which is also its process group id.
    fn pid(&self) -> Option<u32>;

    async fn is_alive(&self) -> bool;

    /// Resident set size of the agent host, when the platform exposes it.
    fn resident_bytes(&self) -> Option<u64>;

    /// SIGTERM, wait up to `grace`, then SIGKILL the whole process group.
    async fn terminate(&self, grace: Duration) -> Result<()>;

    /// Immediate SIGKILL to the process group. Must not block.
    fn kill_now(&self);
}

/// Runs the agent host as a plain child process in its own session and
/// process group, optionally under the sandbox's uid/gid.
#[derive(Debug, Clone)]
pub struct ProcessSandboxRuntime {
    inner: Arc<ProcessRuntimeInner>,
}

#[derive(Debug)]
struct ProcessRuntimeInner {
    program: PathBuf,
    args: Vec<String>,
    assign_identity: bool,
}

impl ProcessSandboxRuntime {
    pub fn new(isolation: &IsolationSettings) -> Result<Self> {
        let program = which(&isolation.agent_command).with_context(|| {
            format!("resolving agent command '{}'", isolation.agent_command)
        })?;

        Ok(Self {
            inner: Arc::new(ProcessRuntimeInner {
                program,
                args: isolation.agent_args.clone(),
                assign_identity: isolation.assign_identity,
            }),
        })
    }

    pub fn program(&self) -> &Path {
        &self.inner.program
    }
}

#[async_trait]
impl SandboxRuntime for ProcessSandboxRuntime {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn SandboxInstance>> {
        let mut command = Command::new(&self.inner.program);
        command
            .args(&self.inner.args)
            .current_dir(&request.workdir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", &request.workdir)
            .env("HIVE_SANDBOX_ID", request.sandbox_id.to_string())
            .env("HIVE_USER_ID", &request.owner_user_id)
            .env("HIVE_AGENT_ID", &request.agent_id)
            .env("HIVE_SANDBOX_WORKDIR", &request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            if self.inner.assign_identity {
                command.uid(request.identity.uid);
                command.gid(request.identity.gid);
            }
            // A new session makes the agent the leader of its own process
            // group so teardown can signal the whole tree at once.
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning {}", self.inner.program.display()))?;
        let pid = child.id();
        debug!(sandbox_id = %request.sandbox_id, pid = ?pid, "agent host spawned");

        Ok(Arc::new(ProcessSandboxInstance {
            sandbox_id: request.sandbox_id,
            pid,
            child: Mutex::new(child),
        }))
    }
}

#[derive(Debug)]
struct ProcessSandboxInstance {
    sandbox_id: Uuid,
    pid: Option<u32>,
    child: Mutex<Child>,
}

#[async_trait]
impl SandboxInstance for ProcessSandboxInstance {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    fn resident_bytes(&self) -> Option<u64> {
        self.pid.and_then(resident_bytes_of)
    }

    async fn terminate(&self, grace: Duration) -> Result<()> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            // Leader is gone; sweep up anything left in its group.
            signal_group(self.pid, Signal::Kill);
            return Ok(());
        }

        signal_group(self.pid, Signal::Term);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(sandbox_id = %self.sandbox_id, ?status, "agent host exited after SIGTERM");
                signal_group(self.pid, Signal::Kill);
                Ok(())
            }
            Err(_) => {
                warn!(sandbox_id = %self.sandbox_id, "agent host ignored SIGTERM; killing process group");
                signal_group(self.pid, Signal::Kill);
                child
                    .kill()
                    .await
                    .map_err(|err| anyhow!("killing agent host: {}", err))?;
                Ok(())
            }
        }
    }

    fn kill_now(&self) {
        signal_group(self.pid, Signal::Kill);
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the process group led by `pid`.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

#[cfg(target_os = "linux")]
fn resident_bytes_of(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages = statm.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes_of(_pid: u32) -> Option<u64> {
    None
}
