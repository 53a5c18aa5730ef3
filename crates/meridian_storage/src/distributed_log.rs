//! Distributed log: local xid → (distributed timestamp, distributed xid) for
//! every locally committed distributed transaction.
//!
//! Commit paths write here before the commit log so a reader that sees a
//! local commit can always resolve the distributed identity.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use meridian_common::error::{MeridianError, MeridianResult};
use meridian_common::types::{DistribTimestamp, DistribXid, Xid};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLogEntry {
    pub distrib_timestamp: DistribTimestamp,
    pub distrib_xid: DistribXid,
}

pub struct DistributedLog {
    entries: DashMap<Xid, DistributedLogEntry>,
    oldest_xmin: AtomicU32,
}

impl Default for DistributedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributedLog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            oldest_xmin: AtomicU32::new(Xid::FIRST_NORMAL.0),
        }
    }

    /// Record the mapping for `xid` and its committed children.
    ///
    /// Outside redo, an existing entry with a different distributed identity
    /// means two coordinators claimed the same local xid.
    pub fn set_committed_tree(
        &self,
        xid: Xid,
        subxids: &[Xid],
        distrib_timestamp: DistribTimestamp,
        distrib_xid: DistribXid,
        is_redo: bool,
    ) -> MeridianResult<()> {
        let entry = DistributedLogEntry {
            distrib_timestamp,
            distrib_xid,
        };
        for &x in std::iter::once(&xid).chain(subxids.iter()) {
            if !x.is_valid() {
                continue;
            }
            if let Some(existing) = self.entries.get(&x) {
                if *existing != entry && !is_redo {
                    return Err(MeridianError::internal_bug(
                        "DLOG-001",
                        format!("distributed log entry for xid {} already set", x),
                        format!(
                            "existing={}/{} new={}/{}",
                            existing.distrib_timestamp,
                            existing.distrib_xid,
                            distrib_timestamp,
                            distrib_xid
                        ),
                    ));
                }
            }
            self.entries.insert(x, entry);
        }
        Ok(())
    }

    /// Distributed identity of a committed local xid, if it was distributed.
    pub fn committed_check(&self, xid: Xid) -> Option<DistributedLogEntry> {
        self.entries.get(&xid).map(|e| *e)
    }

    pub fn oldest_xmin(&self) -> Xid {
        Xid(self.oldest_xmin.load(Ordering::Acquire))
    }

    /// Move the horizon forward (never backward) and drop entries before it.
    pub fn advance_oldest_xmin(&self, xmin: Xid) -> usize {
        let current = self.oldest_xmin();
        if !current.precedes(xmin) {
            return 0;
        }
        self.oldest_xmin.store(xmin.0, Ordering::Release);
        let before = self.entries.len();
        self.entries.retain(|x, _| !x.precedes(xmin));
        let dropped = before - self.entries.len();
        tracing::debug!(
            "distributed log: oldest xmin {} -> {}, dropped {} entries",
            current,
            xmin,
            dropped
        );
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
