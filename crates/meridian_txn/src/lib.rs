pub mod coordinator;
pub mod deadlock;
pub mod distrib_cache;
pub mod hooks;
pub mod known_assigned;
pub mod local_distrib;
pub mod lock;
pub mod parallel;
pub mod proc_array;
pub mod redo;
pub mod resource;
pub mod shared;
pub mod shared_snapshot;
pub mod snapshot;
pub mod twophase;
pub mod xact;

#[cfg(test)]
mod tests;

pub use coordinator::{DistributedIdentity, DtxContext, DtxCoordinator, LocalOnlyCoordinator};
pub use distrib_cache::LocalDistribXactCache;
pub use local_distrib::{LocalDistribXact, LocalDistribXactState};
pub use parallel::{ParallelXactView, SerializedTransactionState};
pub use proc_array::{ProcArray, ProcHandle};
pub use redo::{RedoMode, RedoStats};
pub use shared::{SharedState, SharedStateBuilder};
pub use shared_snapshot::{CursorSnapshotKey, PublishedSnapshot, SharedSnapshotTable};
pub use snapshot::Snapshot;
pub use twophase::{GlobalTransactionData, TwoPhaseState};
pub use xact::{Backend, BackendOptions, TBlockState, TransState, TransactionHandle};

// Re-export from meridian_common for convenience
pub use meridian_common::types::{LocalXid, Xid};
