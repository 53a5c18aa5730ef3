//! Resource owners: what a (sub)transaction must give back when it ends.

use std::path::PathBuf;

use crate::lock::{LockManager, LockOwner, LockTag};

/// Release happens in three passes so that locks are dropped only after
/// everything that may still depend on them (buffer pins, temp files) is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePhase {
    BeforeLocks,
    Locks,
    AfterLocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

#[derive(Debug)]
pub struct ResourceOwner {
    name: &'static str,
    pins: Vec<BufferId>,
    files: Vec<PathBuf>,
    locks: Vec<LockTag>,
}

impl ResourceOwner {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pins: Vec::new(),
            files: Vec::new(),
            locks: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn remember_pin(&mut self, buf: BufferId) {
        self.pins.push(buf);
    }

    pub fn forget_pin(&mut self, buf: BufferId) -> bool {
        match self.pins.iter().rposition(|b| *b == buf) {
            Some(pos) => {
                self.pins.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn remember_file(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    pub fn remember_lock(&mut self, tag: LockTag) {
        self.locks.push(tag);
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    pub fn locks(&self) -> &[LockTag] {
        &self.locks
    }

    /// Hand everything to the parent owner (sub-transaction commit).
    pub fn transfer_to(&mut self, parent: &mut ResourceOwner) {
        parent.pins.append(&mut self.pins);
        parent.files.append(&mut self.files);
        parent.locks.append(&mut self.locks);
    }

    /// One release pass. A top-level owner drops all of the process's locks
    /// at once; a sub-transaction owner releases only what it acquired.
    pub fn release(
        &mut self,
        phase: ReleasePhase,
        is_commit: bool,
        is_top_level: bool,
        locks: &dyn LockManager,
        lock_owner: LockOwner,
    ) {
        match phase {
            ReleasePhase::BeforeLocks => {
                if is_commit && !self.pins.is_empty() {
                    tracing::warn!(
                        "{}: {} buffer pin(s) leaked at commit",
                        self.name,
                        self.pins.len()
                    );
                }
                self.pins.clear();
                for path in self.files.drain(..) {
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!("{}: could not remove {}: {}", self.name, path.display(), e);
                        }
                    }
                }
            }
            ReleasePhase::Locks => {
                if is_top_level {
                    let n = locks.release_all(lock_owner);
                    tracing::trace!("{}: released {} lock(s)", self.name, n);
                } else {
                    for tag in self.locks.drain(..) {
                        locks.release(lock_owner, tag);
                    }
                }
                self.locks.clear();
            }
            ReleasePhase::AfterLocks => {
                tracing::trace!("{}: released", self.name);
            }
        }
    }

    pub fn release_all_phases(
        &mut self,
        is_commit: bool,
        is_top_level: bool,
        locks: &dyn LockManager,
        lock_owner: LockOwner,
    ) {
        for phase in [
            ReleasePhase::BeforeLocks,
            ReleasePhase::Locks,
            ReleasePhase::AfterLocks,
        ] {
            self.release(phase, is_commit, is_top_level, locks, lock_owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InProcessLockManager, LockMode, LockOutcome};
    use meridian_common::types::{Oid, Xid};

    #[test]
    fn test_sub_owner_releases_only_its_locks() {
        let lm = InProcessLockManager::default();
        let owner = LockOwner(3);
        let mut top = ResourceOwner::new("TopTransaction");
        let mut sub = ResourceOwner::new("SubTransaction");

        let a = LockTag::Transaction(Xid(10));
        let b = LockTag::Relation {
            database: Oid(1),
            relation: Oid(2),
        };
        assert_eq!(lm.acquire(owner, a, LockMode::Exclusive), LockOutcome::Granted);
        top.remember_lock(a);
        assert_eq!(lm.acquire(owner, b, LockMode::Exclusive), LockOutcome::Granted);
        sub.remember_lock(b);

        sub.release_all_phases(false, false, &lm, owner);
        assert_eq!(lm.held_by(owner), vec![(a, LockMode::Exclusive)]);
        top.release_all_phases(true, true, &lm, owner);
        assert!(lm.held_by(owner).is_empty());
    }

    #[test]
    fn test_transfer_then_release_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        std::fs::write(&path, b"x").unwrap();
        let lm = InProcessLockManager::default();
        let mut top = ResourceOwner::new("TopTransaction");
        let mut sub = ResourceOwner::new("SubTransaction");
        sub.remember_file(path.clone());
        sub.remember_pin(BufferId(7));
        sub.transfer_to(&mut top);
        assert_eq!(top.pin_count(), 1);
        assert!(top.forget_pin(BufferId(7)));
        top.release(ReleasePhase::BeforeLocks, true, true, &lm, LockOwner(0));
        assert!(!path.exists());
    }
}
