use dashmap::DashMap;
use meridian_common::types::Xid;

/// Sub-transaction parent map, consulted when a process's cached sub-xid
/// array has overflowed.
#[derive(Default)]
pub struct SubTransLog {
    parents: DashMap<Xid, Xid>,
}

impl SubTransLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, xid: Xid, parent: Xid) {
        debug_assert!(parent.precedes(xid), "parent {} must precede {}", parent, xid);
        if let Some(prev) = self.parents.insert(xid, parent) {
            if prev != parent {
                tracing::warn!(
                    "subtrans: xid {} re-parented from {} to {}",
                    xid,
                    prev,
                    parent
                );
            }
        }
    }

    pub fn parent(&self, xid: Xid) -> Option<Xid> {
        self.parents.get(&xid).map(|p| *p)
    }

    /// Follow parent links to the top-level xid. An xid without a recorded
    /// parent is its own topmost.
    pub fn topmost(&self, xid: Xid) -> Xid {
        let mut current = xid;
        while let Some(parent) = self.parent(current) {
            // Parents always precede children; anything else is a stale entry.
            if !parent.precedes(current) {
                break;
            }
            current = parent;
        }
        current
    }

    pub fn truncate_before(&self, cutoff: Xid) -> usize {
        let before = self.parents.len();
        self.parents.retain(|xid, _| !xid.precedes(cutoff));
        before - self.parents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topmost_walks_chain() {
        let log = SubTransLog::new();
        log.set_parent(Xid(101), Xid(100));
        log.set_parent(Xid(102), Xid(101));
        log.set_parent(Xid(103), Xid(102));
        assert_eq!(log.topmost(Xid(103)), Xid(100));
        assert_eq!(log.topmost(Xid(100)), Xid(100));
        assert_eq!(log.parent(Xid(102)), Some(Xid(101)));
    }

    #[test]
    fn test_truncate() {
        let log = SubTransLog::new();
        log.set_parent(Xid(11), Xid(10));
        log.set_parent(Xid(31), Xid(30));
        assert_eq!(log.truncate_before(Xid(20)), 1);
        assert_eq!(log.parent(Xid(11)), None);
    }
}
