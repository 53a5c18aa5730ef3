//! Xids a hot standby must treat as running: everything the primary has
//! handed out that replay has not yet seen finish.

use std::collections::BTreeSet;

use meridian_common::types::Xid;
use parking_lot::Mutex;

/// Upper bound on how many xids one gap fill may add; a larger gap means the
/// standby fell far behind and would rather rely on the commit log.
const MAX_GAP_FILL: u32 = 1 << 20;

#[derive(Debug)]
struct Inner {
    xids: BTreeSet<Xid>,
    latest_observed: Xid,
}

pub struct KnownAssignedXids {
    inner: Mutex<Inner>,
}

impl Default for KnownAssignedXids {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownAssignedXids {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                xids: BTreeSet::new(),
                latest_observed: Xid::INVALID,
            }),
        }
    }

    /// Note that every xid up to and including `xid` has been assigned.
    pub fn record_assigned(&self, xid: Xid) {
        if !xid.is_normal() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.latest_observed.is_valid() && !inner.latest_observed.precedes(xid) {
            return;
        }
        let mut next = if inner.latest_observed.is_valid() {
            inner.latest_observed.advance()
        } else {
            xid
        };
        let gap = xid.0.wrapping_sub(next.0);
        if gap > MAX_GAP_FILL {
            tracing::warn!(
                "known-assigned: gap of {} xids before {}, tracking only the newest",
                gap,
                xid
            );
            next = xid;
        }
        loop {
            inner.xids.insert(next);
            if next == xid {
                break;
            }
            next = next.advance();
        }
        inner.latest_observed = xid;
    }

    /// Drop a finished transaction tree.
    pub fn expire_tree(&self, xid: Xid, subxids: &[Xid]) {
        let mut inner = self.inner.lock();
        inner.xids.remove(&xid);
        for s in subxids {
            inner.xids.remove(s);
        }
    }

    /// Forget sub-xids now tracked through the sub-transaction log.
    pub fn remove(&self, xids: &[Xid]) {
        let mut inner = self.inner.lock();
        for x in xids {
            inner.xids.remove(x);
        }
    }

    pub fn contains(&self, xid: Xid) -> bool {
        self.inner.lock().xids.contains(&xid)
    }

    pub fn latest_observed(&self) -> Xid {
        self.inner.lock().latest_observed
    }

    pub fn snapshot(&self) -> Vec<Xid> {
        self.inner.lock().xids.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().xids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_is_filled() {
        let ka = KnownAssignedXids::new();
        ka.record_assigned(Xid(100));
        ka.record_assigned(Xid(103));
        assert_eq!(ka.snapshot(), vec![Xid(100), Xid(101), Xid(102), Xid(103)]);
        // older xid is a no-op
        ka.record_assigned(Xid(101));
        assert_eq!(ka.len(), 4);
    }

    #[test]
    fn test_expire_tree() {
        let ka = KnownAssignedXids::new();
        ka.record_assigned(Xid(10));
        ka.record_assigned(Xid(12));
        ka.expire_tree(Xid(10), &[Xid(11)]);
        assert_eq!(ka.snapshot(), vec![Xid(12)]);
        assert_eq!(ka.latest_observed(), Xid(12));
    }
}
