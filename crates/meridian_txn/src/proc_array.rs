//! Process array: one slot per backend plus dummy slots for prepared
//! transactions.
//!
//! Membership changes and end-of-transaction xid clearing happen under the
//! `members` write lock; snapshots take the read lock. A slot's own xid is
//! written by its backend while holding the xid generator lock, so a new xid
//! is always visible before any later xid is handed out.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use meridian_common::error::{MeridianResult, XactError};
use meridian_common::types::{BackendId, CommandId, LocalXid, Oid, Xid};
use meridian_storage::SubTransLog;
use parking_lot::{Mutex, RwLock};

use crate::local_distrib::LocalDistribXact;
use crate::snapshot::Snapshot;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    None = 0,
    Lock = 1,
    SharedSnapshot = 2,
}

#[derive(Debug, Default)]
struct SubXidCache {
    xids: Vec<Xid>,
    overflowed: bool,
}

pub struct ProcSlot {
    index: usize,
    pid: AtomicU32,
    lxid: AtomicU32,
    xid: AtomicU32,
    database: AtomicU32,
    role: AtomicU32,
    dummy: AtomicBool,
    wait_state: AtomicU8,
    pub local_distrib: LocalDistribXact,
    subxids: RwLock<SubXidCache>,
}

impl ProcSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            pid: AtomicU32::new(0),
            lxid: AtomicU32::new(0),
            xid: AtomicU32::new(0),
            database: AtomicU32::new(0),
            role: AtomicU32::new(0),
            dummy: AtomicBool::new(false),
            wait_state: AtomicU8::new(WaitState::None as u8),
            local_distrib: LocalDistribXact::new(),
            subxids: RwLock::new(SubXidCache::default()),
        }
    }

    pub fn backend_id(&self) -> BackendId {
        BackendId(self.index as u32)
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn xid(&self) -> Xid {
        Xid(self.xid.load(Ordering::Acquire))
    }

    pub fn set_xid(&self, xid: Xid) {
        self.xid.store(xid.0, Ordering::Release);
    }

    pub fn lxid(&self) -> LocalXid {
        LocalXid(self.lxid.load(Ordering::Acquire))
    }

    pub fn set_lxid(&self, lxid: LocalXid) {
        self.lxid.store(lxid.0, Ordering::Release);
    }

    pub fn database(&self) -> Oid {
        Oid(self.database.load(Ordering::Relaxed))
    }

    pub fn role(&self) -> Oid {
        Oid(self.role.load(Ordering::Relaxed))
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy.load(Ordering::Acquire)
    }

    pub fn wait_state(&self) -> WaitState {
        match self.wait_state.load(Ordering::Relaxed) {
            1 => WaitState::Lock,
            2 => WaitState::SharedSnapshot,
            _ => WaitState::None,
        }
    }

    pub fn set_wait_state(&self, state: WaitState) {
        self.wait_state.store(state as u8, Ordering::Relaxed);
    }

    /// Cached sub-xids, oldest first, and whether the cache overflowed.
    pub fn subxids(&self) -> (Vec<Xid>, bool) {
        let cache = self.subxids.read();
        (cache.xids.clone(), cache.overflowed)
    }

    pub fn add_subxid(&self, xid: Xid, capacity: usize) {
        let mut cache = self.subxids.write();
        if cache.xids.len() < capacity {
            cache.xids.push(xid);
        } else if !cache.overflowed {
            tracing::debug!(
                "backend {}: sub-xid cache overflowed at {} entries",
                self.index,
                capacity
            );
            cache.overflowed = true;
        }
    }

    /// Drop aborted sub-xids from the cache.
    pub fn remove_subxids(&self, xids: &[Xid]) {
        let mut cache = self.subxids.write();
        cache.xids.retain(|x| !xids.contains(x));
    }

    fn clear_xact(&self) {
        self.xid.store(0, Ordering::Release);
        self.lxid.store(0, Ordering::Release);
        let mut cache = self.subxids.write();
        cache.xids.clear();
        cache.overflowed = false;
    }
}

pub struct ProcArray {
    slots: Box<[ProcSlot]>,
    max_backends: usize,
    max_cached_subxids: usize,
    members: RwLock<Vec<usize>>,
    free_backends: Mutex<Vec<usize>>,
    free_dummies: Mutex<Vec<usize>>,
    latest_completed_xid: AtomicU32,
}

impl ProcArray {
    pub fn new(max_backends: usize, max_prepared: usize, max_cached_subxids: usize) -> Self {
        let total = max_backends + max_prepared;
        let slots: Vec<ProcSlot> = (0..total).map(ProcSlot::new).collect();
        // Pop from the back, so reverse to hand out low indexes first.
        let free_backends: Vec<usize> = (0..max_backends).rev().collect();
        let free_dummies: Vec<usize> = (max_backends..total).rev().collect();
        Self {
            slots: slots.into_boxed_slice(),
            max_backends,
            max_cached_subxids,
            members: RwLock::new(Vec::with_capacity(total)),
            free_backends: Mutex::new(free_backends),
            free_dummies: Mutex::new(free_dummies),
            latest_completed_xid: AtomicU32::new(Xid::FROZEN.0),
        }
    }

    pub fn max_cached_subxids(&self) -> usize {
        self.max_cached_subxids
    }

    pub fn slot(&self, index: usize) -> &ProcSlot {
        &self.slots[index]
    }

    pub fn slot_for_backend(&self, id: BackendId) -> Option<&ProcSlot> {
        self.slots.get(id.0 as usize)
    }

    /// Claim a backend slot and join the array.
    pub fn acquire(self: &Arc<Self>, pid: u32, database: Oid, role: Oid) -> MeridianResult<ProcHandle> {
        let index = self
            .free_backends
            .lock()
            .pop()
            .ok_or(XactError::TooManyConnections(self.max_backends))?;
        let slot = &self.slots[index];
        slot.pid.store(pid, Ordering::Release);
        slot.database.store(database.0, Ordering::Relaxed);
        slot.role.store(role.0, Ordering::Relaxed);
        slot.dummy.store(false, Ordering::Release);
        slot.clear_xact();
        slot.local_distrib.clear();
        self.members.write().push(index);
        tracing::debug!("proc array: backend {} joined (pid {})", index, pid);
        Ok(ProcHandle {
            array: Arc::clone(self),
            index,
        })
    }

    fn release(&self, index: usize) {
        let slot = &self.slots[index];
        if slot.xid().is_valid() {
            tracing::warn!(
                "proc array: backend {} left while still holding xid {}",
                index,
                slot.xid()
            );
        }
        {
            let mut members = self.members.write();
            members.retain(|&i| i != index);
            slot.clear_xact();
            slot.pid.store(0, Ordering::Release);
            slot.local_distrib.clear();
            slot.set_wait_state(WaitState::None);
        }
        self.free_backends.lock().push(index);
        tracing::debug!("proc array: backend {} left", index);
    }

    /// Install a slot standing in for a prepared transaction, so the xid
    /// keeps reading as running after its backend moved on.
    pub fn acquire_dummy(
        &self,
        xid: Xid,
        subxids: &[Xid],
        database: Oid,
        role: Oid,
    ) -> MeridianResult<usize> {
        let index = self
            .free_dummies
            .lock()
            .pop()
            .ok_or(XactError::TooManyConnections(self.slots.len() - self.max_backends))?;
        let slot = &self.slots[index];
        slot.pid.store(0, Ordering::Release);
        slot.database.store(database.0, Ordering::Relaxed);
        slot.role.store(role.0, Ordering::Relaxed);
        slot.dummy.store(true, Ordering::Release);
        {
            let mut cache = slot.subxids.write();
            cache.xids.clear();
            cache.overflowed = subxids.len() > self.max_cached_subxids;
            cache
                .xids
                .extend(subxids.iter().take(self.max_cached_subxids).copied());
        }
        slot.set_xid(xid);
        self.members.write().push(index);
        Ok(index)
    }

    pub fn release_dummy(&self, index: usize, latest_xid: Xid) {
        {
            let mut members = self.members.write();
            members.retain(|&i| i != index);
            self.slots[index].clear_xact();
            self.slots[index].dummy.store(false, Ordering::Release);
            self.advance_latest_completed(latest_xid);
        }
        self.free_dummies.lock().push(index);
    }

    /// Retire the slot's transaction. After this returns no new snapshot
    /// counts the xid as running.
    pub fn end_transaction(&self, index: usize, latest_xid: Xid) {
        let slot = &self.slots[index];
        let _members = self.members.write();
        slot.clear_xact();
        slot.local_distrib.clear();
        if latest_xid.is_valid() {
            self.advance_latest_completed(latest_xid);
        }
    }

    /// Retire an aborted subtransaction tree while the top-level
    /// transaction keeps running.
    pub fn remove_subxids(&self, index: usize, xids: &[Xid], latest_xid: Xid) {
        let _members = self.members.write();
        self.slots[index].remove_subxids(xids);
        self.advance_latest_completed(latest_xid);
    }

    /// Clear the slot without completing the xid; used once a dummy slot
    /// has taken over a prepared transaction.
    pub fn clear_transaction(&self, index: usize) {
        let _members = self.members.write();
        self.slots[index].clear_xact();
        self.slots[index].local_distrib.clear();
    }

    fn advance_latest_completed(&self, xid: Xid) {
        if !xid.is_normal() {
            return;
        }
        let _ = self
            .latest_completed_xid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if Xid(cur).precedes(xid) || !Xid(cur).is_normal() {
                    Some(xid.0)
                } else {
                    None
                }
            });
    }

    pub fn latest_completed_xid(&self) -> Xid {
        Xid(self.latest_completed_xid.load(Ordering::Acquire))
    }

    /// Recovery sets the horizon from the last replayed xid.
    pub fn set_latest_completed_xid(&self, xid: Xid) {
        let _members = self.members.write();
        self.advance_latest_completed(xid);
    }

    /// Running transactions as seen by `own` (excluded from `xip`).
    pub fn snapshot(&self, own: Option<usize>, curcid: CommandId) -> Snapshot {
        let members = self.members.read();
        let xmax = self.latest_completed_xid().advance();
        let mut xmin = xmax;
        let mut xip = Vec::new();
        let mut subxip = Vec::new();
        let mut suboverflowed = false;
        for &i in members.iter() {
            if Some(i) == own {
                continue;
            }
            let slot = &self.slots[i];
            let xid = slot.xid();
            if !xid.is_normal() || !xid.precedes(xmax) {
                continue;
            }
            if xid.precedes(xmin) {
                xmin = xid;
            }
            xip.push(xid);
            let cache = slot.subxids.read();
            if cache.overflowed {
                suboverflowed = true;
            }
            subxip.extend(cache.xids.iter().copied().filter(|x| x.precedes(xmax)));
        }
        if let Some(own) = own {
            let mine = self.slots[own].xid();
            if mine.is_normal() && mine.precedes(xmin) {
                xmin = mine;
            }
        }
        Snapshot {
            xmin,
            xmax,
            xip,
            subxip,
            suboverflowed,
            curcid,
        }
    }

    /// Whether any slot is running `xid`, as a top-level or cached sub-xid.
    pub fn is_in_progress(&self, xid: Xid, subtrans: &SubTransLog) -> bool {
        if !xid.is_normal() {
            return false;
        }
        let members = self.members.read();
        let mut any_overflow = false;
        for &i in members.iter() {
            let slot = &self.slots[i];
            if slot.xid() == xid {
                return true;
            }
            let cache = slot.subxids.read();
            if cache.xids.contains(&xid) {
                return true;
            }
            any_overflow |= cache.overflowed;
        }
        if any_overflow {
            let top = subtrans.topmost(xid);
            if top != xid {
                return members.iter().any(|&i| self.slots[i].xid() == top);
            }
        }
        false
    }

    pub fn find_by_xid(&self, xid: Xid) -> Option<usize> {
        let members = self.members.read();
        members
            .iter()
            .copied()
            .find(|&i| self.slots[i].xid() == xid)
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }
}

/// A backend's claim on its process slot. Dropping it leaves the array.
pub struct ProcHandle {
    array: Arc<ProcArray>,
    index: usize,
}

impl ProcHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn backend_id(&self) -> BackendId {
        BackendId(self.index as u32)
    }

    pub fn slot(&self) -> &ProcSlot {
        self.array.slot(self.index)
    }
}

impl Drop for ProcHandle {
    fn drop(&mut self) {
        self.array.release(self.index);
    }
}

impl std::fmt::Debug for ProcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcHandle")
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array() -> Arc<ProcArray> {
        Arc::new(ProcArray::new(4, 2, 2))
    }

    #[test]
    fn test_acquire_and_drop_returns_slot() {
        let pa = array();
        let handles: Vec<_> = (0..4)
            .map(|pid| pa.acquire(pid, Oid(1), Oid(10)).unwrap())
            .collect();
        assert!(pa.acquire(99, Oid(1), Oid(10)).is_err());
        drop(handles);
        assert_eq!(pa.member_count(), 0);
        assert!(pa.acquire(5, Oid(1), Oid(10)).is_ok());
    }

    #[test]
    fn test_snapshot_excludes_own_and_finished() {
        let pa = array();
        let a = pa.acquire(1, Oid(1), Oid(10)).unwrap();
        let b = pa.acquire(2, Oid(1), Oid(10)).unwrap();
        a.slot().set_xid(Xid(100));
        b.slot().set_xid(Xid(101));
        pa.set_latest_completed_xid(Xid(101));

        let snap = pa.snapshot(Some(a.index()), CommandId::FIRST);
        assert_eq!(snap.xip, vec![Xid(101)]);
        assert_eq!(snap.xmin, Xid(100));
        assert_eq!(snap.xmax, Xid(102));

        pa.end_transaction(b.index(), Xid(101));
        let snap = pa.snapshot(Some(a.index()), CommandId::FIRST);
        assert!(snap.xip.is_empty());
    }

    #[test]
    fn test_subxid_overflow_resolves_through_subtrans() {
        let pa = array();
        let subtrans = SubTransLog::new();
        let h = pa.acquire(1, Oid(1), Oid(10)).unwrap();
        h.slot().set_xid(Xid(200));
        for x in 201..=204 {
            subtrans.set_parent(Xid(x), Xid(200));
            h.slot().add_subxid(Xid(x), pa.max_cached_subxids());
        }
        let (cached, overflowed) = h.slot().subxids();
        assert_eq!(cached, vec![Xid(201), Xid(202)]);
        assert!(overflowed);
        assert!(pa.is_in_progress(Xid(204), &subtrans));
        assert!(!pa.is_in_progress(Xid(300), &subtrans));
    }

    #[test]
    fn test_dummy_keeps_xid_running() {
        let pa = array();
        let subtrans = SubTransLog::new();
        let idx = pa
            .acquire_dummy(Xid(50), &[Xid(51)], Oid(1), Oid(10))
            .unwrap();
        assert!(pa.slot(idx).is_dummy());
        assert!(pa.is_in_progress(Xid(51), &subtrans));
        pa.release_dummy(idx, Xid(51));
        assert!(!pa.is_in_progress(Xid(50), &subtrans));
        assert_eq!(pa.latest_completed_xid(), Xid(51));
    }
}
