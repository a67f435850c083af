//! Host-wide resource state shared by all sandboxes: the isolation identity
//! pool and the global memory reservation counter.

use std::{
    collections::{HashSet, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// A uid/gid pair owned by exactly one live sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IsolationIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Bounded pool of isolation identities with FIFO reuse.
#[derive(Debug)]
pub struct IdentityPool {
    capacity: usize,
    state: Mutex<IdentityPoolState>,
}

#[derive(Debug)]
struct IdentityPoolState {
    free: VecDeque<IsolationIdentity>,
    in_use: HashSet<IsolationIdentity>,
    drained: bool,
}

impl IdentityPool {
    pub fn new(base_uid: u32, base_gid: u32, size: usize) -> Self {
        let free = (0..size as u32)
            .map(|offset| IsolationIdentity {
                uid: base_uid + offset,
                gid: base_gid + offset,
            })
            .collect();

        Self {
            capacity: size,
            state: Mutex::new(IdentityPoolState {
                free,
                in_use: HashSet::new(),
                drained: false,
            }),
        }
    }

    pub fn acquire(&self) -> Option<IsolationIdentity> {
        let mut state = self.state.lock();
        if state.drained {
            return None;
        }
        let identity = state.free.pop_front()?;
        state.in_use.insert(identity);
        Some(identity)
    }

    /// Returns an identity to the back of the free queue. Releasing an
    /// identity that is not checked out is ignored.
    pub fn release(&self, identity: IsolationIdentity) {
        let mut state = self.state.lock();
        if !state.in_use.remove(&identity) {
            warn!(uid = identity.uid, gid = identity.gid, "released identity was not in use");
            return;
        }
        state.free.push_back(identity);
    }

    pub fn available(&self) -> usize {
        let state = self.state.lock();
        if state.drained {
            0
        } else {
            state.free.len()
        }
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops handing out identities. Returns how many are still checked out.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        state.drained = true;
        state.in_use.len()
    }
}

/// Lock-free reservation counter against the host's global memory budget.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: u64,
    reserved: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            reserved: AtomicU64::new(0),
        }
    }

    pub fn try_reserve(&self, bytes: u64) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|next| *next <= self.limit)
            })
            .is_ok()
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.reserved())
    }
}

/// Source of the host's currently free memory, consulted by the reclamation sweep.
pub trait HostMemoryGauge: Send + Sync + 'static {
    fn free_bytes(&self) -> u64;
}

/// Free memory as the unreserved part of the global budget.
#[derive(Debug, Clone)]
pub struct BudgetMemoryGauge {
    budget: Arc<MemoryBudget>,
}

impl BudgetMemoryGauge {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self { budget }
    }
}

impl HostMemoryGauge for BudgetMemoryGauge {
    fn free_bytes(&self) -> u64 {
        self.budget.available()
    }
}

/// Reads `MemAvailable` from `/proc/meminfo`, falling back to the budget when
/// the file is missing or unparsable.
#[derive(Debug, Clone)]
pub struct ProcMeminfoGauge {
    path: PathBuf,
    fallback: BudgetMemoryGauge,
}

impl ProcMeminfoGauge {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self::with_path("/proc/meminfo", budget)
    }

    pub fn with_path(path: impl Into<PathBuf>, budget: Arc<MemoryBudget>) -> Self {
        Self {
            path: path.into(),
            fallback: BudgetMemoryGauge::new(budget),
        }
    }
}

impl HostMemoryGauge for ProcMeminfoGauge {
    fn free_bytes(&self) -> u64 {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|contents| parse_mem_available(&contents))
            .unwrap_or_else(|| self.fallback.free_bytes())
    }
}

/// Extracts `MemAvailable` (reported in kB) from meminfo contents, in bytes.
pub fn parse_mem_available(contents: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        Some(kib * 1024)
    })
}
