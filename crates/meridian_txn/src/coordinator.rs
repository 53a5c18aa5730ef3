//! Distributed transaction (DTX) coordinator seam.
//!
//! The transaction core never talks to other nodes itself. On a coordinator
//! (QD) it asks a [`DtxCoordinator`] to run phase one before recording the
//! local commit, and tells it the outcome afterwards; the coordinator drives
//! `COMMIT PREPARED` / `ROLLBACK PREPARED` on the executors (QEs).

use std::sync::atomic::{AtomicU64, Ordering};

use meridian_common::error::MeridianResult;
use meridian_common::types::{DistribTimestamp, DistribXid, Xid};
use serde::{Deserialize, Serialize};

/// Role of this backend in a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtxContext {
    /// Single-node operation; no distributed bookkeeping.
    LocalOnly,
    /// Coordinator; creates distributed ids and runs two-phase commit.
    QdDistributedCapable,
    /// Executor writer inside an explicit coordinator transaction block.
    QeTwoPhaseExplicitWriter,
    /// Executor writer for an implicit (single statement) distributed
    /// transaction; the local block stays open until the coordinator ends it.
    QeTwoPhaseImplicitWriter,
    /// Executor autocommit statement, committed with one phase.
    QeAutoCommitImplicit,
    /// Executor reader sharing the writer's snapshot.
    QeReader,
    /// Entry-db singleton reader on the coordinator.
    QeEntryDbSingleton,
    /// Executor that just prepared.
    QePrepared,
    /// Executor finishing a prepared transaction.
    QeFinishPrepared,
}

impl DtxContext {
    pub fn is_coordinator(self) -> bool {
        self == DtxContext::QdDistributedCapable
    }

    /// Readers never own an xid and resolve "current transaction" through
    /// their writer.
    pub fn is_reader(self) -> bool {
        matches!(self, DtxContext::QeReader | DtxContext::QeEntryDbSingleton)
    }

    pub fn is_implicit_writer(self) -> bool {
        self == DtxContext::QeTwoPhaseImplicitWriter
    }

    pub fn is_executor_writer(self) -> bool {
        matches!(
            self,
            DtxContext::QeTwoPhaseExplicitWriter
                | DtxContext::QeTwoPhaseImplicitWriter
                | DtxContext::QeAutoCommitImplicit
                | DtxContext::QePrepared
                | DtxContext::QeFinishPrepared
        )
    }
}

/// Cluster-wide identity of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistributedIdentity {
    pub timestamp: DistribTimestamp,
    pub xid: DistribXid,
}

impl DistributedIdentity {
    /// Global transaction id used when the executors prepare.
    pub fn gid(&self) -> String {
        format!("{}-{:010}", self.timestamp.0, self.xid.0)
    }
}

pub trait DtxCoordinator: Send + Sync {
    fn create_distributed_xid(&self) -> DistributedIdentity;

    /// Phase one. `Err` means at least one participant failed to prepare;
    /// the caller aborts.
    fn prepare(&self, gxid: DistributedIdentity, local_xid: Option<Xid>) -> MeridianResult<()>;

    /// Phase two after the local commit record is durable.
    fn notify_committed(&self, gxid: DistributedIdentity) -> MeridianResult<()>;

    fn notify_aborted(&self, gxid: DistributedIdentity) -> MeridianResult<()>;

    /// Resolve a prepared transaction on every participant.
    fn finish_prepared(&self, gid: &str, commit: bool) -> MeridianResult<()>;
}

/// Coordinator for a node with no participants: every phase succeeds
/// trivially.
pub struct LocalOnlyCoordinator {
    timestamp: DistribTimestamp,
    next_xid: AtomicU64,
}

impl LocalOnlyCoordinator {
    pub fn new(timestamp: DistribTimestamp) -> Self {
        Self {
            timestamp,
            next_xid: AtomicU64::new(1),
        }
    }
}

impl Default for LocalOnlyCoordinator {
    fn default() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);
        Self::new(DistribTimestamp(secs))
    }
}

impl DtxCoordinator for LocalOnlyCoordinator {
    fn create_distributed_xid(&self) -> DistributedIdentity {
        DistributedIdentity {
            timestamp: self.timestamp,
            xid: DistribXid(self.next_xid.fetch_add(1, Ordering::Relaxed)),
        }
    }

    fn prepare(&self, gxid: DistributedIdentity, local_xid: Option<Xid>) -> MeridianResult<()> {
        tracing::debug!(
            "dtx prepare {} (local xid {:?}): no participants",
            gxid.gid(),
            local_xid
        );
        Ok(())
    }

    fn notify_committed(&self, _gxid: DistributedIdentity) -> MeridianResult<()> {
        Ok(())
    }

    fn notify_aborted(&self, _gxid: DistributedIdentity) -> MeridianResult<()> {
        Ok(())
    }

    fn finish_prepared(&self, _gid: &str, _commit: bool) -> MeridianResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_only_ids_are_unique() {
        let c = LocalOnlyCoordinator::new(DistribTimestamp(17));
        let a = c.create_distributed_xid();
        let b = c.create_distributed_xid();
        assert_ne!(a.xid, b.xid);
        assert_eq!(a.gid(), "17-0000000001");
    }

    #[test]
    fn test_context_roles() {
        assert!(DtxContext::QeReader.is_reader());
        assert!(DtxContext::QeEntryDbSingleton.is_reader());
        assert!(!DtxContext::QeTwoPhaseImplicitWriter.is_reader());
        assert!(DtxContext::QdDistributedCapable.is_coordinator());
        assert!(DtxContext::QeAutoCommitImplicit.is_executor_writer());
    }
}
