use serde::{Deserialize, Serialize};
use std::fmt;

/// Local transaction identifier.
///
/// Ids below [`Xid::FIRST_NORMAL`] are reserved. Normal ids wrap around at
/// 2^32 and are compared with modulo-2^32 arithmetic, so "a precedes b" means
/// `a` lies in the 2^31 ids before `b`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Xid(pub u32);

impl Xid {
    pub const INVALID: Xid = Xid(0);
    pub const BOOTSTRAP: Xid = Xid(1);
    pub const FROZEN: Xid = Xid(2);
    pub const FIRST_NORMAL: Xid = Xid(3);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Wraparound-aware `self < other`.
    pub fn precedes(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn precedes_or_equals(self, other: Xid) -> bool {
        self == other || self.precedes(other)
    }

    pub fn follows(self, other: Xid) -> bool {
        other.precedes(self)
    }

    pub fn follows_or_equals(self, other: Xid) -> bool {
        self == other || other.precedes(self)
    }

    /// Next id in allocation order, skipping the reserved ids on wraparound.
    pub fn advance(self) -> Xid {
        let next = self.0.wrapping_add(1);
        if next < Self::FIRST_NORMAL.0 {
            Self::FIRST_NORMAL
        } else {
            Xid(next)
        }
    }

    /// Wraparound-aware ordering, for sorting id arrays of one transaction tree.
    pub fn cmp_logical(&self, other: &Xid) -> std::cmp::Ordering {
        if self == other {
            std::cmp::Ordering::Equal
        } else if self.precedes(*other) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sub-transaction counter, scoped to one top-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubXactId(pub u32);

impl SubXactId {
    pub const INVALID: SubXactId = SubXactId(0);
    pub const TOP: SubXactId = SubXactId(1);
}

impl fmt::Display for SubXactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CommandId(pub u32);

impl CommandId {
    pub const FIRST: CommandId = CommandId(0);
    pub const INVALID: CommandId = CommandId(u32::MAX);
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual transaction id, assigned to every top-level transaction whether or
/// not it ever acquires an [`Xid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalXid(pub u32);

impl LocalXid {
    pub const INVALID: LocalXid = LocalXid(0);
}

impl fmt::Display for LocalXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lxid:{}", self.0)
    }
}

/// Index of a process-array entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub u32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend:{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Oid(pub u32);

impl Oid {
    pub const INVALID: Oid = Oid(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte position in the durable log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Distributed session identifier, shared by the writer and all readers of
/// one session on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "con{}", self.0)
    }
}

/// Coordinator-assigned distributed transaction id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DistribXid(pub u64);

impl DistribXid {
    pub const INVALID: DistribXid = DistribXid(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for DistribXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dxid:{}", self.0)
    }
}

/// Coordinator start timestamp, distinguishing distributed ids across
/// coordinator restarts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DistribTimestamp(pub u32);

impl fmt::Display for DistribTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TimestampTz(pub i64);

impl TimestampTz {
    pub fn now() -> Self {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        TimestampTz(micros)
    }
}

impl fmt::Display for TimestampTz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical identity of a relation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelFileNode {
    pub spc_node: Oid,
    pub db_node: Oid,
    pub rel_node: Oid,
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// A database directory inside one tablespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbDirSpec {
    pub database: Oid,
    pub tablespace: Oid,
}

/// Session bootstrap output: who is running transactions in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub database: Oid,
    pub role: Oid,
    pub tablespace: Oid,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self {
            database: Oid(1),
            role: Oid(10),
            tablespace: Oid(1663),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_wraparound_ordering() {
        assert!(Xid(100).precedes(Xid(101)));
        assert!(!Xid(101).precedes(Xid(100)));
        // u32::MAX is "before" a small normal id after wraparound
        assert!(Xid(u32::MAX).precedes(Xid(5)));
        assert!(Xid(5).follows(Xid(u32::MAX)));
        // special ids compare numerically
        assert!(Xid::FROZEN.precedes(Xid(u32::MAX)));
    }

    #[test]
    fn test_xid_advance_skips_reserved() {
        assert_eq!(Xid(10).advance(), Xid(11));
        assert_eq!(Xid(u32::MAX).advance(), Xid::FIRST_NORMAL);
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn(0x1_0000_0010).to_string(), "1/00000010");
    }
}
