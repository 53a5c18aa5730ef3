//! Commit log: the authoritative per-xid outcome.
//!
//! Entries are rebuilt by redo after a crash, so the map itself is volatile.
//! Visibility checks consult it only after the process array says an xid is
//! no longer running.

use dashmap::DashMap;
use meridian_common::types::{Lsn, Xid};
use serde::{Deserialize, Serialize};

use crate::subtrans::SubTransLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XidStatus {
    InProgress,
    /// Committed as part of a tree whose top-level commit is still being
    /// recorded. Resolved through the parent chain.
    SubCommitted,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct ClogEntry {
    status: XidStatus,
    /// Commit record position for asynchronously committed xids; readers
    /// that need durability must flush the log up to here first.
    async_lsn: Lsn,
}

#[derive(Default)]
pub struct CommitLog {
    entries: DashMap<Xid, ClogEntry>,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a transaction tree.
    ///
    /// For a commit, children first move to `SubCommitted`, then the top xid
    /// commits, then the children commit, so no reader can see a child as
    /// committed while its top-level xid still reads as running.
    pub fn set_tree_status(&self, xid: Xid, subxids: &[Xid], status: XidStatus, async_lsn: Lsn) {
        if status == XidStatus::Committed && !subxids.is_empty() {
            for &sub in subxids {
                self.set(sub, XidStatus::SubCommitted, async_lsn);
            }
        }
        if status == XidStatus::Aborted {
            for &sub in subxids {
                self.set(sub, XidStatus::Aborted, async_lsn);
            }
        }
        if xid.is_valid() {
            self.set(xid, status, async_lsn);
        }
        if status == XidStatus::Committed {
            for &sub in subxids {
                self.set(sub, XidStatus::Committed, async_lsn);
            }
        }
    }

    fn set(&self, xid: Xid, status: XidStatus, async_lsn: Lsn) {
        self.entries.insert(xid, ClogEntry { status, async_lsn });
    }

    pub fn status(&self, xid: Xid) -> XidStatus {
        if xid == Xid::BOOTSTRAP || xid == Xid::FROZEN {
            return XidStatus::Committed;
        }
        if !xid.is_valid() {
            return XidStatus::Aborted;
        }
        self.entries
            .get(&xid)
            .map(|e| e.status)
            .unwrap_or(XidStatus::InProgress)
    }

    pub fn async_commit_lsn(&self, xid: Xid) -> Lsn {
        self.entries
            .get(&xid)
            .map(|e| e.async_lsn)
            .unwrap_or(Lsn::INVALID)
    }

    /// True once `xid` (resolving a sub-committed xid to its topmost parent)
    /// is committed.
    pub fn did_commit(&self, xid: Xid, subtrans: &SubTransLog) -> bool {
        match self.status(xid) {
            XidStatus::Committed => true,
            XidStatus::SubCommitted => {
                let top = subtrans.topmost(xid);
                top != xid && self.status(top) == XidStatus::Committed
            }
            _ => false,
        }
    }

    pub fn did_abort(&self, xid: Xid) -> bool {
        self.status(xid) == XidStatus::Aborted
    }

    /// Forget outcomes of xids preceding `cutoff`; returns how many were dropped.
    pub fn truncate_before(&self, cutoff: Xid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|xid, _| !xid.precedes(cutoff));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_xid_is_in_progress() {
        let clog = CommitLog::new();
        assert_eq!(clog.status(Xid(500)), XidStatus::InProgress);
        assert_eq!(clog.status(Xid::FROZEN), XidStatus::Committed);
        assert_eq!(clog.status(Xid::INVALID), XidStatus::Aborted);
    }

    #[test]
    fn test_commit_tree_marks_children() {
        let clog = CommitLog::new();
        let subtrans = SubTransLog::new();
        clog.set_tree_status(
            Xid(100),
            &[Xid(101), Xid(102)],
            XidStatus::Committed,
            Lsn(64),
        );
        for x in [100, 101, 102] {
            assert!(clog.did_commit(Xid(x), &subtrans));
        }
        assert_eq!(clog.async_commit_lsn(Xid(101)), Lsn(64));
    }

    #[test]
    fn test_subcommitted_resolves_through_parent() {
        let clog = CommitLog::new();
        let subtrans = SubTransLog::new();
        subtrans.set_parent(Xid(11), Xid(10));
        clog.set(Xid(11), XidStatus::SubCommitted, Lsn::INVALID);
        assert!(!clog.did_commit(Xid(11), &subtrans));
        clog.set(Xid(10), XidStatus::Committed, Lsn::INVALID);
        assert!(clog.did_commit(Xid(11), &subtrans));
    }

    #[test]
    fn test_abort_tree_and_truncate() {
        let clog = CommitLog::new();
        clog.set_tree_status(Xid(20), &[Xid(21)], XidStatus::Aborted, Lsn::INVALID);
        clog.set_tree_status(Xid(40), &[], XidStatus::Committed, Lsn::INVALID);
        assert!(clog.did_abort(Xid(21)));
        assert_eq!(clog.truncate_before(Xid(30)), 2);
        assert_eq!(clog.len(), 1);
    }
}
