use meridian_common::types::{CommandId, Xid};
use serde::{Deserialize, Serialize};

/// Set of transactions considered running at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every xid older than this had finished.
    pub xmin: Xid,
    /// Every xid at or past this had not started.
    pub xmax: Xid,
    pub xip: Vec<Xid>,
    pub subxip: Vec<Xid>,
    /// Some process had more sub-xids than it could cache; `subxip` is
    /// incomplete and callers must resolve through the sub-transaction log.
    pub suboverflowed: bool,
    pub curcid: CommandId,
}

impl Snapshot {
    /// Whether `xid` counts as still running under this snapshot.
    ///
    /// With `suboverflowed` set a sub-xid may be missing from `subxip`; pass
    /// its topmost xid instead.
    pub fn xid_in_progress(&self, xid: Xid) -> bool {
        if !xid.is_normal() {
            return false;
        }
        if xid.precedes(self.xmin) {
            return false;
        }
        if xid.follows_or_equals(self.xmax) {
            return true;
        }
        self.xip.contains(&xid) || self.subxip.contains(&xid)
    }
}

/// A (cmin, cmax) pair for a tuple both inserted and deleted by the same
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboCid {
    pub cmin: CommandId,
    pub cmax: CommandId,
}
