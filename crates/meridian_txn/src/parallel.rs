//! Transaction state handed to parallel workers.
//!
//! A worker never assigns xids or changes the stack; it only needs to know
//! which xids count as "its own" and the command id to read at.

use meridian_common::error::{MeridianError, MeridianResult};
use meridian_common::types::{CommandId, Xid};
use serde::{Deserialize, Serialize};

use crate::xact::Backend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedTransactionState {
    pub top_xid: Xid,
    pub current_xid: Xid,
    pub command_id: CommandId,
    /// Every xid of the stack plus committed children, in logical order.
    pub xids: Vec<Xid>,
}

impl SerializedTransactionState {
    pub fn to_bytes(&self) -> MeridianResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MeridianError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> MeridianResult<Self> {
        bincode::deserialize(bytes).map_err(|e| MeridianError::Serialization(e.to_string()))
    }
}

/// Upper bound on the encoded size of this backend's transaction state.
pub fn estimate_transaction_state_space(backend: &Backend) -> usize {
    let stack = backend.transaction_stack();
    let xids: usize = stack
        .frames()
        .iter()
        .map(|f| 1 + f.child_xids.len())
        .sum();
    // top_xid, current_xid, command_id, vec length prefix
    4 + 4 + 4 + 8 + xids * std::mem::size_of::<Xid>()
}

impl Backend {
    pub fn serialize_transaction_state(&self) -> SerializedTransactionState {
        let mut xids = Vec::new();
        for frame in self.transaction_stack().frames() {
            if frame.xid.is_valid() {
                xids.push(frame.xid);
            }
            xids.extend_from_slice(&frame.child_xids);
        }
        xids.sort_by(|a, b| a.cmp_logical(b));
        xids.dedup();
        SerializedTransactionState {
            top_xid: self.get_top_transaction_id_if_any().unwrap_or(Xid::INVALID),
            current_xid: self
                .get_current_transaction_id_if_any()
                .unwrap_or(Xid::INVALID),
            command_id: self.current_command_id(),
            xids,
        }
    }
}

/// Read-only view a parallel worker holds of its leader's transaction.
#[derive(Debug, Clone)]
pub struct ParallelXactView {
    state: SerializedTransactionState,
}

impl ParallelXactView {
    pub fn new(state: SerializedTransactionState) -> Self {
        Self { state }
    }

    pub fn from_bytes(bytes: &[u8]) -> MeridianResult<Self> {
        Ok(Self::new(SerializedTransactionState::from_bytes(bytes)?))
    }

    pub fn top_xid(&self) -> Xid {
        self.state.top_xid
    }

    pub fn command_id(&self) -> CommandId {
        self.state.command_id
    }

    pub fn is_current_transaction_id(&self, xid: Xid) -> bool {
        if !xid.is_valid() {
            return false;
        }
        self.state
            .xids
            .binary_search_by(|x| x.cmp_logical(&xid))
            .is_ok()
    }
}
