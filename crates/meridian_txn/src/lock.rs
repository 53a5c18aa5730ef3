//! Heavyweight locks as seen by the transaction core.
//!
//! The core only needs a handful of operations: take the xid lock when an xid
//! is assigned, wait for another transaction to finish, release everything at
//! end of transaction and hand a prepared transaction's locks to its dummy
//! process slot. `InProcessLockManager` implements them for a single node.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use meridian_common::cancel::CancelToken;
use meridian_common::config::LockConfig;
use meridian_common::error::{CancelReason, LockError, MeridianError, MeridianResult};
use meridian_common::types::{Oid, Xid};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::deadlock::WaitForGraph;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockTag {
    /// Held exclusively by the transaction owning the xid until it ends.
    Transaction(Xid),
    Relation { database: Oid, relation: Oid },
    Object { class: Oid, id: u32 },
    Advisory(u64),
}

impl fmt::Display for LockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTag::Transaction(xid) => write!(f, "transaction {}", xid),
            LockTag::Relation { database, relation } => {
                write!(f, "relation {} of database {}", relation, database)
            }
            LockTag::Object { class, id } => write!(f, "object {} of class {}", id, class),
            LockTag::Advisory(key) => write!(f, "advisory lock {}", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Share,
    Exclusive,
}

impl LockMode {
    pub fn conflicts_with(self, other: LockMode) -> bool {
        !(self == LockMode::Share && other == LockMode::Share)
    }
}

/// Lock holder identity: a process slot index (real or dummy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockOwner(pub u32);

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Queued; call [`LockManager::wait`].
    Wait,
    /// The request can never be granted because of a lock the owner itself
    /// holds; no timeout is needed to see it.
    Deadlock,
}

pub trait LockManager: Send + Sync {
    /// Try to take `tag` without blocking.
    fn acquire(&self, owner: LockOwner, tag: LockTag, mode: LockMode) -> LockOutcome;

    /// Block until a queued request is granted, canceled or chosen as a
    /// deadlock victim.
    fn wait(
        &self,
        owner: LockOwner,
        tag: LockTag,
        mode: LockMode,
        cancel: &CancelToken,
    ) -> MeridianResult<()>;

    /// Release one acquisition of `tag`.
    fn release(&self, owner: LockOwner, tag: LockTag) -> bool;

    fn release_all(&self, owner: LockOwner) -> usize;

    /// Move every lock held by `from` to `to`.
    fn transfer_all(&self, from: LockOwner, to: LockOwner) -> usize;

    /// Abort a pending wait of `owner`, if any.
    fn cancel_wait(&self, owner: LockOwner);

    fn deadlock_check(&self, owner: LockOwner) -> Option<Vec<LockOwner>>;

    fn held_by(&self, owner: LockOwner) -> Vec<(LockTag, LockMode)>;

    fn lock(
        &self,
        owner: LockOwner,
        tag: LockTag,
        mode: LockMode,
        cancel: &CancelToken,
    ) -> MeridianResult<()> {
        match self.acquire(owner, tag, mode) {
            LockOutcome::Granted => Ok(()),
            LockOutcome::Deadlock => Err(LockError::SelfDeadlock(owner.0).into()),
            LockOutcome::Wait => self.wait(owner, tag, mode, cancel),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    mode: LockMode,
    count: u32,
}

#[derive(Debug, Default)]
struct LockState {
    holders: HashMap<LockOwner, Holder>,
    waiters: Vec<(LockOwner, LockMode)>,
}

impl LockState {
    fn blockers(&self, owner: LockOwner, mode: LockMode) -> Vec<LockOwner> {
        let mut out: Vec<LockOwner> = self
            .holders
            .iter()
            .filter(|(o, h)| **o != owner && h.mode.conflicts_with(mode))
            .map(|(o, _)| *o)
            .collect();
        out.sort();
        out
    }

    fn grant(&mut self, owner: LockOwner, mode: LockMode) {
        let h = self.holders.entry(owner).or_insert(Holder { mode, count: 0 });
        h.mode = h.mode.max(mode);
        h.count += 1;
        self.waiters.retain(|(o, _)| *o != owner);
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<LockTag, LockState>,
    canceled: HashSet<LockOwner>,
}

impl LockTable {
    fn drop_waiter(&mut self, owner: LockOwner, tag: LockTag) {
        if let Some(st) = self.locks.get_mut(&tag) {
            st.waiters.retain(|(o, _)| *o != owner);
            if st.is_unused() {
                self.locks.remove(&tag);
            }
        }
        self.canceled.remove(&owner);
    }
}

pub struct InProcessLockManager {
    table: Mutex<LockTable>,
    cond: Condvar,
    graph: WaitForGraph,
    deadlock_timeout: Duration,
    lock_timeout: Option<Duration>,
}

impl InProcessLockManager {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            cond: Condvar::new(),
            graph: WaitForGraph::new(),
            deadlock_timeout: Duration::from_millis(config.deadlock_timeout_ms),
            lock_timeout: (config.lock_timeout_ms > 0)
                .then(|| Duration::from_millis(config.lock_timeout_ms)),
        }
    }

    pub fn waiter_count(&self, tag: LockTag) -> usize {
        self.table
            .lock()
            .locks
            .get(&tag)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    fn stop_waiting(&self, table: &mut LockTable, owner: LockOwner, tag: LockTag) {
        table.drop_waiter(owner, tag);
        self.graph.clear_waits_of(owner);
    }
}

impl Default for InProcessLockManager {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

impl LockManager for InProcessLockManager {
    fn acquire(&self, owner: LockOwner, tag: LockTag, mode: LockMode) -> LockOutcome {
        let mut t = self.table.lock();
        let st = t.locks.entry(tag).or_default();
        if let Some(h) = st.holders.get_mut(&owner) {
            if h.mode >= mode {
                h.count += 1;
                return LockOutcome::Granted;
            }
        }
        let blockers = st.blockers(owner, mode);
        if blockers.is_empty() {
            st.grant(owner, mode);
            return LockOutcome::Granted;
        }
        // Upgrading while another holder of the same lock already waits to
        // upgrade: neither can ever proceed.
        if st.holders.contains_key(&owner)
            && st.waiters.iter().any(|(w, _)| blockers.contains(w))
        {
            return LockOutcome::Deadlock;
        }
        if !st.waiters.iter().any(|(w, _)| *w == owner) {
            st.waiters.push((owner, mode));
        }
        for b in blockers {
            self.graph.add_wait(owner, b);
        }
        LockOutcome::Wait
    }

    fn wait(
        &self,
        owner: LockOwner,
        tag: LockTag,
        mode: LockMode,
        cancel: &CancelToken,
    ) -> MeridianResult<()> {
        let start = Instant::now();
        let mut next_check = self.deadlock_timeout;
        let mut t = self.table.lock();
        loop {
            if t.canceled.contains(&owner) {
                self.stop_waiting(&mut t, owner, tag);
                return Err(MeridianError::Canceled(CancelReason::UserRequest));
            }
            if let Err(e) = cancel.check() {
                self.stop_waiting(&mut t, owner, tag);
                return Err(e);
            }
            let st = t.locks.entry(tag).or_default();
            let blockers = st.blockers(owner, mode);
            if blockers.is_empty() {
                st.grant(owner, mode);
                self.graph.clear_waits_of(owner);
                return Ok(());
            }
            self.graph.clear_waits_of(owner);
            for b in &blockers {
                self.graph.add_wait(owner, *b);
            }

            let elapsed = start.elapsed();
            if let Some(limit) = self.lock_timeout {
                if elapsed >= limit {
                    self.stop_waiting(&mut t, owner, tag);
                    return Err(MeridianError::Canceled(CancelReason::LockTimeout));
                }
            }
            if elapsed >= next_check {
                next_check = elapsed + self.deadlock_timeout;
                if let Some(cycle) = self.graph.detect_cycle_from(owner) {
                    let victim = WaitForGraph::choose_victim(&cycle);
                    if victim == owner {
                        self.stop_waiting(&mut t, owner, tag);
                        metrics::counter!("meridian_lock_deadlocks_total").increment(1);
                        let path: Vec<String> = cycle.iter().map(|o| o.to_string()).collect();
                        tracing::warn!(
                            "deadlock on {}: {} (victim {})",
                            tag,
                            path.join(" -> "),
                            owner
                        );
                        return Err(LockError::Deadlock(format!(
                            "{} waits for {} in cycle {}",
                            owner,
                            tag,
                            path.join(" -> ")
                        ))
                        .into());
                    }
                    tracing::debug!("deadlock on {}: waiting for victim {}", tag, victim);
                }
            }
            self.cond.wait_for(&mut t, WAIT_POLL_INTERVAL);
        }
    }

    fn release(&self, owner: LockOwner, tag: LockTag) -> bool {
        let mut t = self.table.lock();
        let Some(st) = t.locks.get_mut(&tag) else {
            return false;
        };
        let Some(h) = st.holders.get_mut(&owner) else {
            return false;
        };
        h.count -= 1;
        if h.count == 0 {
            st.holders.remove(&owner);
        }
        if st.is_unused() {
            t.locks.remove(&tag);
        }
        self.cond.notify_all();
        true
    }

    fn release_all(&self, owner: LockOwner) -> usize {
        let mut t = self.table.lock();
        let mut released = 0;
        for st in t.locks.values_mut() {
            if st.holders.remove(&owner).is_some() {
                released += 1;
            }
        }
        t.locks.retain(|_, st| !st.is_unused());
        self.graph.remove_owner(owner);
        self.cond.notify_all();
        released
    }

    fn transfer_all(&self, from: LockOwner, to: LockOwner) -> usize {
        let mut t = self.table.lock();
        let mut moved = 0;
        for st in t.locks.values_mut() {
            if let Some(h) = st.holders.remove(&from) {
                let dst = st.holders.entry(to).or_insert(Holder {
                    mode: h.mode,
                    count: 0,
                });
                dst.mode = dst.mode.max(h.mode);
                dst.count += h.count;
                moved += 1;
            }
        }
        self.graph.remove_owner(from);
        moved
    }

    fn cancel_wait(&self, owner: LockOwner) {
        let mut t = self.table.lock();
        let waiting = t
            .locks
            .values()
            .any(|st| st.waiters.iter().any(|(w, _)| *w == owner));
        if waiting {
            t.canceled.insert(owner);
            self.cond.notify_all();
        }
    }

    fn deadlock_check(&self, owner: LockOwner) -> Option<Vec<LockOwner>> {
        self.graph.detect_cycle_from(owner)
    }

    fn held_by(&self, owner: LockOwner) -> Vec<(LockTag, LockMode)> {
        let t = self.table.lock();
        t.locks
            .iter()
            .filter_map(|(tag, st)| st.holders.get(&owner).map(|h| (*tag, h.mode)))
            .collect()
    }
}
