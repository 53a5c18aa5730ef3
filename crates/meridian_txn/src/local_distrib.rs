//! Per-process local/distributed transaction state.
//!
//! Each process slot carries one of these. The owning backend is the only
//! writer; other processes read it without taking a lock, so a read is a hint
//! that may be one transition behind. Identity fields are stored before the
//! state so a reader that observes a state also observes the identity that
//! came with it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{DistribTimestamp, DistribXid};
use serde::{Deserialize, Serialize};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalDistribXactState {
    None = 0,
    Active = 1,
    Committed = 2,
    Aborted = 3,
    Prepared = 4,
}

impl LocalDistribXactState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Active,
            2 => Self::Committed,
            3 => Self::Aborted,
            4 => Self::Prepared,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Active => "Active",
            Self::Committed => "Committed",
            Self::Aborted => "Aborted",
            Self::Prepared => "Prepared",
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_move_to(self, to: Self) -> bool {
        use LocalDistribXactState::*;
        matches!(
            (self, to),
            (None, Active)
                | (Active, Prepared)
                | (Active, Committed)
                | (Active, Aborted)
                | (Aborted, Aborted)
        )
    }
}

impl std::fmt::Display for LocalDistribXactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a [`LocalDistribXact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDistribXactData {
    pub state: LocalDistribXactState,
    pub distrib_timestamp: DistribTimestamp,
    pub distrib_xid: DistribXid,
}

pub struct LocalDistribXact {
    state: AtomicU8,
    distrib_timestamp: AtomicU32,
    distrib_xid: AtomicU64,
}

impl Default for LocalDistribXact {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDistribXact {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LocalDistribXactState::None as u8),
            distrib_timestamp: AtomicU32::new(0),
            distrib_xid: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LocalDistribXactState {
        LocalDistribXactState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn distrib_xid(&self) -> DistribXid {
        // Acquire on the state first so the identity matches it.
        let _ = self.state.load(Ordering::Acquire);
        DistribXid(self.distrib_xid.load(Ordering::Relaxed))
    }

    pub fn distrib_timestamp(&self) -> DistribTimestamp {
        let _ = self.state.load(Ordering::Acquire);
        DistribTimestamp(self.distrib_timestamp.load(Ordering::Relaxed))
    }

    pub fn data(&self) -> LocalDistribXactData {
        let state = self.state();
        LocalDistribXactData {
            state,
            distrib_timestamp: DistribTimestamp(self.distrib_timestamp.load(Ordering::Relaxed)),
            distrib_xid: DistribXid(self.distrib_xid.load(Ordering::Relaxed)),
        }
    }

    /// Attach a distributed identity and move `None → Active`.
    pub fn start(&self, timestamp: DistribTimestamp, dxid: DistribXid) -> MeridianResult<()> {
        let current = self.state();
        if !current.can_move_to(LocalDistribXactState::Active) {
            return Err(illegal(current, LocalDistribXactState::Active));
        }
        self.distrib_timestamp.store(timestamp.0, Ordering::Relaxed);
        self.distrib_xid.store(dxid.0, Ordering::Relaxed);
        self.state
            .store(LocalDistribXactState::Active as u8, Ordering::Release);
        Ok(())
    }

    /// Validated state change. An illegal transition is a fatal error.
    pub fn change_state(&self, to: LocalDistribXactState) -> MeridianResult<()> {
        let from = self.state();
        if !from.can_move_to(to) {
            return Err(illegal(from, to));
        }
        self.state.store(to as u8, Ordering::Release);
        Ok(())
    }

    /// Back to `None` once the process slot no longer runs the transaction.
    pub fn clear(&self) {
        self.state
            .store(LocalDistribXactState::None as u8, Ordering::Release);
        self.distrib_xid.store(0, Ordering::Relaxed);
        self.distrib_timestamp.store(0, Ordering::Relaxed);
    }

    pub fn display_string(&self) -> String {
        let d = self.data();
        match d.state {
            LocalDistribXactState::None => "local transaction".to_string(),
            state => format!(
                "distributed transaction {}-{:010} state {}",
                d.distrib_timestamp.0, d.distrib_xid.0, state
            ),
        }
    }
}

fn illegal(from: LocalDistribXactState, to: LocalDistribXactState) -> MeridianError {
    tracing::error!(
        "illegal local/distributed transaction state change {} -> {}",
        from,
        to
    );
    XactError::IllegalDistribTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::error::Severity;

    #[test]
    fn test_normal_lifecycle() {
        let ld = LocalDistribXact::new();
        assert_eq!(ld.state(), LocalDistribXactState::None);
        ld.start(DistribTimestamp(7), DistribXid(42)).unwrap();
        assert_eq!(ld.state(), LocalDistribXactState::Active);
        assert_eq!(ld.distrib_xid(), DistribXid(42));
        ld.change_state(LocalDistribXactState::Committed).unwrap();
        ld.clear();
        assert_eq!(ld.state(), LocalDistribXactState::None);
        assert_eq!(ld.distrib_xid(), DistribXid::INVALID);
    }

    #[test]
    fn test_aborted_may_repeat() {
        let ld = LocalDistribXact::new();
        ld.start(DistribTimestamp(1), DistribXid(1)).unwrap();
        ld.change_state(LocalDistribXactState::Aborted).unwrap();
        ld.change_state(LocalDistribXactState::Aborted).unwrap();
    }

    #[test]
    fn test_illegal_transitions_are_fatal() {
        let ld = LocalDistribXact::new();
        let err = ld
            .change_state(LocalDistribXactState::Committed)
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);

        ld.start(DistribTimestamp(1), DistribXid(1)).unwrap();
        ld.change_state(LocalDistribXactState::Prepared).unwrap();
        assert!(ld.change_state(LocalDistribXactState::Committed).is_err());
        assert!(ld.start(DistribTimestamp(2), DistribXid(2)).is_err());
        // state untouched by the rejected changes
        assert_eq!(ld.state(), LocalDistribXactState::Prepared);
    }

    #[test]
    fn test_display_string() {
        let ld = LocalDistribXact::new();
        assert_eq!(ld.display_string(), "local transaction");
        ld.start(DistribTimestamp(1700000000), DistribXid(12)).unwrap();
        assert_eq!(
            ld.display_string(),
            "distributed transaction 1700000000-0000000012 state Active"
        );
    }
}
