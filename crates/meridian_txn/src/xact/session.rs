//! Handle-based session API over the block dispatch, and the shared
//! snapshot operations of writers and readers.

use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{LocalXid, SessionId, Xid};

use super::state::{TBlockState, TransState};
use super::Backend;
use crate::shared_snapshot::{CursorSnapshotKey, PublishedSnapshot};
use crate::snapshot::Snapshot;

/// Names one top-level transaction of a backend. Stale once that
/// transaction has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    lxid: LocalXid,
}

impl TransactionHandle {
    pub fn lxid(&self) -> LocalXid {
        self.lxid
    }
}

impl Backend {
    fn handle_is_current(&self, handle: TransactionHandle) -> bool {
        handle.lxid == self.lxid
            && self.lxid != LocalXid::INVALID
            && self.is_transaction_or_transaction_block()
    }

    fn check_handle(&self, handle: TransactionHandle) -> MeridianResult<()> {
        if self.handle_is_current(handle) {
            return Ok(());
        }
        let current = if self.is_transaction_or_transaction_block() {
            self.lxid.0
        } else {
            0
        };
        Err(XactError::StaleHandle {
            handle: handle.lxid.0,
            current,
        }
        .into())
    }

    /// One statement: start, run `f`, finish. A failing statement leaves
    /// the block failed (or the transaction rolled back outside a block).
    fn run_statement<T>(
        &mut self,
        f: impl FnOnce(&mut Backend) -> MeridianResult<T>,
    ) -> MeridianResult<T> {
        if let Err(e) = self.start_transaction_command() {
            self.abort_current_transaction();
            return Err(e);
        }
        let out = match f(self) {
            Ok(out) => out,
            Err(e) => {
                self.abort_current_transaction();
                return Err(e);
            }
        };
        if let Err(e) = self.commit_transaction_command() {
            self.abort_current_transaction();
            return Err(e);
        }
        Ok(out)
    }

    /// `BEGIN`: open a transaction block.
    pub fn begin(&mut self) -> MeridianResult<TransactionHandle> {
        self.run_statement(|b| b.begin_transaction_block())?;
        Ok(TransactionHandle { lxid: self.lxid })
    }

    /// `COMMIT`. Returns false when the block had failed and was rolled back
    /// instead.
    pub fn commit(&mut self, handle: TransactionHandle) -> MeridianResult<bool> {
        self.check_handle(handle)?;
        self.run_statement(|b| b.end_transaction_block())
    }

    /// `ROLLBACK`. Never fails; the backend ends up outside any
    /// transaction. A stale handle names a transaction that already ended,
    /// so there is nothing to do.
    pub fn abort(&mut self, handle: TransactionHandle) {
        if !self.handle_is_current(handle) {
            tracing::debug!(
                "backend {}: abort of finished transaction {}",
                self.proc.backend_id(),
                handle.lxid
            );
            return;
        }
        let clean = matches!(
            self.block_state(),
            TBlockState::Started
                | TBlockState::ImplicitInProgress
                | TBlockState::InProgress
                | TBlockState::Abort
                | TBlockState::SubInProgress
                | TBlockState::SubAbort
        );
        if clean {
            if let Err(e) = self.run_statement(|b| b.user_abort_transaction_block()) {
                tracing::warn!("backend {}: rollback failed: {}", self.proc.backend_id(), e);
            }
        }
        if self.block_state() != TBlockState::Default
            || self.trans_state() != TransState::Default
        {
            self.abort_out_of_any_transaction();
        }
    }

    /// `PREPARE TRANSACTION gid`. Returns false when nothing was prepared
    /// because the block had failed and was rolled back.
    pub fn prepare(&mut self, handle: TransactionHandle, gid: &str) -> MeridianResult<bool> {
        self.check_handle(handle)?;
        self.run_statement(|b| b.prepare_transaction_block(gid))
    }

    /// Run one statement's work inside the transaction.
    pub fn execute<T>(
        &mut self,
        handle: TransactionHandle,
        f: impl FnOnce(&mut Backend) -> MeridianResult<T>,
    ) -> MeridianResult<T> {
        self.check_handle(handle)?;
        if self.block_state().is_failed() {
            return Err(XactError::InFailedTransaction.into());
        }
        self.run_statement(f)
    }

    pub fn save_point_begin(&mut self, handle: TransactionHandle, name: &str) -> MeridianResult<()> {
        self.check_handle(handle)?;
        self.run_statement(|b| b.define_savepoint(name))
    }

    pub fn save_point_release(
        &mut self,
        handle: TransactionHandle,
        name: &str,
    ) -> MeridianResult<()> {
        self.check_handle(handle)?;
        self.run_statement(|b| b.release_savepoint(name))
    }

    pub fn save_point_rollback(
        &mut self,
        handle: TransactionHandle,
        name: &str,
    ) -> MeridianResult<()> {
        self.check_handle(handle)?;
        self.run_statement(|b| b.rollback_to_savepoint(name))
    }

    /// Top-level xid of the handle's transaction, if it has one yet.
    pub fn current_transaction_id(&self, handle: TransactionHandle) -> Option<Xid> {
        if !self.handle_is_current(handle) {
            return None;
        }
        self.get_top_transaction_id_if_any()
    }

    pub fn is_current_transaction_id(&self, handle: TransactionHandle, xid: Xid) -> bool {
        self.handle_is_current(handle) && self.transaction_id_is_current(xid)
    }

    // ── Shared snapshots ──

    fn session_id(&self) -> MeridianResult<SessionId> {
        self.options
            .session
            .ok_or_else(|| MeridianError::invalid_state("shared snapshot", "no distributed session"))
    }

    /// Writer: make `snapshot` and the current transaction fields visible to
    /// the session's readers. Returns the sync counter readers can wait on.
    pub fn publish_snapshot(&mut self, snapshot: Snapshot) -> MeridianResult<u32> {
        let Some(index) = self.writer_slot() else {
            return Err(MeridianError::invalid_state(
                "publish_snapshot",
                "backend is not a session writer",
            ));
        };
        self.segmate_sync = self.segmate_sync.wrapping_add(1);

        // Frames rolled back but not yet cleaned up are no longer current.
        let mut subxids: Vec<Xid> = Vec::new();
        for (depth, frame) in self.stack.frames().iter().enumerate() {
            if frame.state == TransState::Abort {
                continue;
            }
            if depth > 0 && frame.xid.is_valid() {
                subxids.push(frame.xid);
            }
            subxids.extend_from_slice(&frame.child_xids);
        }
        subxids.sort_by(|a, b| a.cmp_logical(b));

        let published = PublishedSnapshot {
            xid: self.stack.top().xid,
            cid: self.command_id,
            start_timestamp: self.start_timestamp,
            qd_xid: self.distributed_xid(),
            qd_cid: self.qd_cid,
            segmate_sync: self.segmate_sync,
            snapshot,
            combocids: self.combocids.clone(),
            subxids,
        };
        self.shared.snapshots.publish(index, published)?;
        metrics::counter!("meridian_shared_snapshot_publish_total").increment(1);
        tracing::trace!(
            "backend {}: published snapshot sync {}",
            self.proc.backend_id(),
            self.segmate_sync
        );
        Ok(self.segmate_sync)
    }

    /// Writer: take a snapshot of the process array and publish it.
    pub fn take_and_publish_snapshot(&mut self) -> MeridianResult<Snapshot> {
        let snapshot = self
            .shared
            .proc_array
            .snapshot(Some(self.proc.index()), self.command_id);
        self.publish_snapshot(snapshot.clone())?;
        Ok(snapshot)
    }

    /// Everything the session's writer last published, waiting for the
    /// first publication.
    pub fn lookup_published_snapshot(&self) -> MeridianResult<PublishedSnapshot> {
        let session = self.session_id()?;
        match self.snapshot_slot {
            Some(index) => self.shared.snapshots.read(index, session, &self.cancel),
            None => self.shared.snapshots.lookup_snapshot(session, &self.cancel),
        }
    }

    /// Reader: the writer's snapshot.
    pub fn lookup_snapshot(&self) -> MeridianResult<Snapshot> {
        Ok(self.lookup_published_snapshot()?.snapshot)
    }

    /// Reader: the writer's snapshot for statement `segmate_sync`, waiting
    /// until the writer has published it.
    pub fn lookup_snapshot_synced(&self, segmate_sync: u32) -> MeridianResult<PublishedSnapshot> {
        let session = self.session_id()?;
        let index = match self.snapshot_slot {
            Some(index) => index,
            None => self.shared.snapshots.lookup(session, &self.cancel)?,
        };
        self.shared
            .snapshots
            .read_synced(index, session, segmate_sync, &self.cancel)
    }

    /// Writer: persist the current snapshot for a cursor that may outlive
    /// this statement.
    pub fn declare_cursor_snapshot(&self) -> MeridianResult<CursorSnapshotKey> {
        let Some(index) = self.writer_slot() else {
            return Err(MeridianError::invalid_state(
                "declare_cursor_snapshot",
                "backend is not a session writer",
            ));
        };
        self.shared.snapshots.dump_for_cursor(index, &self.cancel)
    }

    pub fn read_cursor_snapshot(&self, key: &CursorSnapshotKey) -> MeridianResult<PublishedSnapshot> {
        self.shared.snapshots.read_for_cursor(key)
    }
}

#[cfg(test)]
mod tests {
    use meridian_common::config::MeridianConfig;

    use super::*;
    use crate::shared::SharedState;
    use crate::xact::BackendOptions;

    fn backend() -> Backend {
        let shared = SharedState::in_memory(MeridianConfig::default()).unwrap();
        Backend::connect(&shared, BackendOptions::default()).unwrap()
    }

    #[test]
    fn test_handle_goes_stale_after_commit() {
        let mut b = backend();
        let h = b.begin().unwrap();
        b.execute(h, |b| b.get_top_transaction_id().map(|_| ())).unwrap();
        assert!(b.current_transaction_id(h).is_some());
        assert!(b.commit(h).unwrap());

        assert!(b.current_transaction_id(h).is_none());
        let err = b.commit(h).unwrap_err();
        assert!(matches!(err, MeridianError::Xact(XactError::StaleHandle { .. })));
    }

    #[test]
    fn test_execute_in_failed_block() {
        let mut b = backend();
        let h = b.begin().unwrap();
        let err = b
            .execute(h, |_| -> MeridianResult<()> {
                Err(XactError::TooManyCommands.into())
            })
            .unwrap_err();
        assert!(matches!(err, MeridianError::Xact(XactError::TooManyCommands)));
        assert_eq!(b.block_state(), TBlockState::Abort);

        let err = b.execute(h, |_| Ok(())).unwrap_err();
        assert!(matches!(err, MeridianError::Xact(XactError::InFailedTransaction)));
        assert!(!b.commit(h).unwrap());
        assert_eq!(b.block_state(), TBlockState::Default);
    }

    #[test]
    fn test_abort_twice_is_harmless() {
        let mut b = backend();
        let h = b.begin().unwrap();
        b.save_point_begin(h, "a").unwrap();
        b.abort(h);
        b.abort(h);
        assert_eq!(b.block_state(), TBlockState::Default);
    }

    #[test]
    fn test_publish_requires_writer() {
        let mut b = backend();
        let h = b.begin().unwrap();
        assert!(b.publish_snapshot(Snapshot::default()).is_err());
        assert!(b.lookup_snapshot().is_err());
        b.abort(h);
    }
}
