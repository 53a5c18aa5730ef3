//! Low-level start/commit/abort/prepare of top-level transactions and
//! subtransactions.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{
    CommandId, DbDirSpec, LocalXid, Lsn, Oid, RelFileNode, SubXactId, TimestampTz, Xid,
};
use meridian_storage::xact_record::{DistribInfo, XLOG_XACT_PREPARE};
use meridian_storage::xlog::RM_XACT_ID;
use meridian_storage::XlogRecord;

use super::state::TransState;
use super::Backend;
use crate::hooks::{SubXactEvent, XactEvent};
use crate::local_distrib::LocalDistribXactState;
use crate::lock::LockOwner;
use crate::proc_array::WaitState;
use crate::resource::ReleasePhase;
use crate::twophase::GlobalTransactionData;

impl Backend {
    pub(crate) fn start_transaction(&mut self) -> MeridianResult<()> {
        self.shared.check_usable()?;
        let state = self.stack.top().state;
        if state != TransState::Default {
            tracing::warn!("start_transaction while in {} state", state);
        }
        self.shared
            .resource_group
            .on_xact_start(self.proc.backend_id())?;

        self.stack.reset();
        self.stack.top_mut().state = TransState::Start;
        self.command_id = CommandId::FIRST;
        self.command_id_used = false;
        self.lxid = self.shared.allocate_lxid();
        self.proc.slot().set_lxid(self.lxid);
        self.start_timestamp = TimestampTz::now();
        self.update_slot_xact_info();
        self.stack.top_mut().state = TransState::InProgress;
        tracing::trace!(
            "backend {}: started transaction {}",
            self.proc.backend_id(),
            self.lxid
        );
        Ok(())
    }

    /// Commit the top-level transaction. Errors before the commit record is
    /// written leave the transaction for the caller to abort; after it, every
    /// step is best effort.
    pub(crate) fn commit_transaction(&mut self) -> MeridianResult<()> {
        if !self.stack.is_top_level() {
            return Err(MeridianError::internal_bug(
                "XACT-COMMIT-001",
                "commit_transaction with open subtransactions",
                self.stack.describe(),
            ));
        }
        let state = self.stack.top().state;
        if state != TransState::InProgress {
            tracing::warn!("commit_transaction while in {} state", state);
        }

        // Closing a holdable cursor can fire a trigger that opens another.
        self.pre_commit.run_to_fixed_point()?;
        self.callbacks.fire_xact(XactEvent::PreCommit)?;

        let two_phase = self.options.dtx_context.is_coordinator() && self.did_write;
        if two_phase {
            if let Some(identity) = self.distributed {
                let xid = self.stack.top().xid;
                if let Err(e) = self
                    .shared
                    .coordinator
                    .prepare(identity, xid.is_valid().then_some(xid))
                {
                    tracing::warn!("distributed prepare of {} failed: {}", identity.gid(), e);
                    return Err(XactError::DistributedPrepareFailed(identity.gid()).into());
                }
            }
        }

        self.cancel.hold_interrupts();
        self.stack.top_mut().state = TransState::Commit;
        let latest = match self.record_transaction_commit() {
            Ok(latest) => latest,
            Err(e) => {
                self.cancel.resume_interrupts();
                return Err(e);
            }
        };

        if two_phase {
            if let Some(identity) = self.distributed {
                if let Err(e) = self.shared.coordinator.notify_committed(identity) {
                    tracing::error!(
                        "could not notify participants of commit of {}: {}",
                        identity.gid(),
                        e
                    );
                } else if let Err(e) = self.log_distributed_forget(identity) {
                    tracing::warn!("could not log forget of {}: {}", identity.gid(), e);
                }
            }
        }

        let ld = &self.proc.slot().local_distrib;
        if ld.state() == LocalDistribXactState::Active {
            if let Err(e) = ld.change_state(LocalDistribXactState::Committed) {
                tracing::error!("{}", e);
            }
        }
        self.shared
            .proc_array
            .end_transaction(self.proc.index(), latest);

        self.callbacks.fire_xact_best_effort(XactEvent::Commit);
        self.release_top_owner(ReleasePhase::BeforeLocks, true);
        let rels = self.take_pending_deletes(true, 0);
        let dbs = self.take_pending_deldbs();
        self.drop_storage(&rels, &dbs, self.tablespace_to_delete);
        self.release_top_owner(ReleasePhase::Locks, true);
        self.release_top_owner(ReleasePhase::AfterLocks, true);

        self.end_of_transaction(true);
        metrics::counter!("meridian_xact_total", "action" => "commit").increment(1);
        tracing::debug!(
            "backend {}: committed xid {}",
            self.proc.backend_id(),
            self.stack.top().xid
        );
        self.reset_after_transaction();
        self.cancel.resume_interrupts();
        Ok(())
    }

    /// Abort the top-level transaction. Never fails; every step that can go
    /// wrong is logged and skipped.
    pub(crate) fn abort_transaction(&mut self) {
        self.cancel.hold_interrupts();
        // Leave any lock queue first so nobody waits on a dead request.
        self.shared.locks.cancel_wait(self.lock_owner);
        self.proc.slot().set_wait_state(WaitState::None);

        let state = self.stack.top().state;
        if !matches!(state, TransState::InProgress | TransState::Prepare) {
            tracing::warn!("abort_transaction while in {} state", state);
        }
        self.stack.top_mut().state = TransState::Abort;
        self.pre_commit.clear();

        let latest = match self.record_transaction_abort(false) {
            Ok(latest) => latest,
            Err(e) => {
                tracing::error!(
                    "{}: {} (backend {})",
                    e.pg_severity(),
                    e,
                    self.proc.backend_id()
                );
                self.stack.top().xid
            }
        };

        if self.options.dtx_context.is_coordinator() && self.did_write {
            if let Some(identity) = self.distributed {
                if let Err(e) = self.shared.coordinator.notify_aborted(identity) {
                    tracing::error!(
                        "could not notify participants of abort of {}: {}",
                        identity.gid(),
                        e
                    );
                }
            }
        }
        let ld = &self.proc.slot().local_distrib;
        if matches!(
            ld.state(),
            LocalDistribXactState::Active | LocalDistribXactState::Aborted
        ) {
            if let Err(e) = ld.change_state(LocalDistribXactState::Aborted) {
                tracing::error!("{}", e);
            }
        }
        self.shared
            .proc_array
            .end_transaction(self.proc.index(), latest);

        self.callbacks.fire_xact_best_effort(XactEvent::Abort);
        self.release_top_owner(ReleasePhase::BeforeLocks, false);
        let rels = self.take_pending_deletes(false, 0);
        self.drop_storage(&rels, &[], None);
        self.release_top_owner(ReleasePhase::Locks, false);
        self.release_top_owner(ReleasePhase::AfterLocks, false);

        self.end_of_transaction(false);
        metrics::counter!("meridian_xact_total", "action" => "abort").increment(1);
        tracing::debug!(
            "backend {}: aborted xid {}",
            self.proc.backend_id(),
            self.stack.top().xid
        );
        self.cancel.resume_interrupts();
    }

    /// Second half of an abort: forget the transaction entirely.
    pub(crate) fn cleanup_transaction(&mut self) {
        let state = self.stack.top().state;
        if state != TransState::Abort {
            tracing::error!("cleanup_transaction: unexpected state {}", state);
        }
        if !self.stack.is_top_level() {
            tracing::error!(
                "cleanup_transaction with {} open subtransaction(s)",
                self.stack.depth() - 1
            );
        }
        self.reset_after_transaction();
    }

    /// Hand the transaction to a dummy process slot and a two-phase state
    /// record so any backend can finish it.
    pub(crate) fn prepare_transaction(&mut self, gid: &str) -> MeridianResult<()> {
        if !self.stack.is_top_level() {
            return Err(MeridianError::internal_bug(
                "XACT-PREPARE-001",
                "prepare_transaction with open subtransactions",
                self.stack.describe(),
            ));
        }
        let state = self.stack.top().state;
        if state != TransState::InProgress {
            return Err(MeridianError::invalid_state("prepare_transaction", state));
        }

        self.pre_commit.run_to_fixed_point()?;
        self.callbacks.fire_xact(XactEvent::PrePrepare)?;
        if self.exported_snapshots {
            return Err(XactError::PrepareExportedSnapshots.into());
        }
        if self.accessed_temp_rel {
            return Err(XactError::PrepareTempRelation.into());
        }
        let xid = self.get_top_transaction_id()?;

        self.cancel.hold_interrupts();
        self.stack.top_mut().state = TransState::Prepare;
        let result = self.write_prepare(gid, xid);
        self.cancel.resume_interrupts();
        let (data, dummy) = result?;

        // The PREPARE record is durable; the transaction now belongs to the
        // two-phase table whatever happens below.
        let ld = &self.proc.slot().local_distrib;
        if ld.state() == LocalDistribXactState::Active {
            if let Err(e) = ld.change_state(LocalDistribXactState::Prepared) {
                return Err(self.abandon_logged_transaction(xid, "PREPARE", e));
            }
        }
        if let Err(e) = self.shared.twophase.end_prepare(data, dummy) {
            return Err(self.abandon_logged_transaction(xid, "PREPARE", e));
        }
        self.shared.proc_array.clear_transaction(self.proc.index());

        self.callbacks.fire_xact_best_effort(XactEvent::Prepare);
        // Locks now belong to the dummy slot; this releases nothing else.
        self.release_top_owner(ReleasePhase::BeforeLocks, true);
        self.release_top_owner(ReleasePhase::Locks, true);
        self.release_top_owner(ReleasePhase::AfterLocks, true);

        self.end_of_transaction(true);
        metrics::counter!("meridian_xact_total", "action" => "prepare").increment(1);
        tracing::info!(
            "backend {}: prepared transaction {} (xid {})",
            self.proc.backend_id(),
            gid,
            xid
        );
        self.reset_after_transaction();
        Ok(())
    }

    fn write_prepare(
        &mut self,
        gid: &str,
        xid: Xid,
    ) -> MeridianResult<(GlobalTransactionData, usize)> {
        let identity = self.options.identity;
        self.shared.twophase.mark_as_preparing(
            gid,
            xid,
            identity.database,
            identity.role,
            self.proc.backend_id(),
        )?;
        let subxids = self.stack.top().child_xids.clone();
        let dummy = match self.shared.proc_array.acquire_dummy(
            xid,
            &subxids,
            identity.database,
            identity.role,
        ) {
            Ok(d) => d,
            Err(e) => {
                self.shared.twophase.forget(gid);
                return Err(e);
            }
        };

        let mut data = GlobalTransactionData {
            gid: gid.to_string(),
            xid,
            subxids,
            database: identity.database,
            owner: identity.role,
            prepared_at: TimestampTz::now(),
            prepare_lsn: Lsn::INVALID,
            locks: self.shared.locks.held_by(self.lock_owner),
            commit_rels: self.pending_rels(true),
            abort_rels: self.pending_rels(false),
            invals: self.pending_invals.iter().map(|(_, m)| *m).collect(),
            distrib: self.distributed.map(|d| DistribInfo {
                distrib_timestamp: d.timestamp,
                distrib_xid: d.xid,
            }),
        };

        let logged = bincode::serialize(&data)
            .map_err(|e| MeridianError::Serialization(e.to_string()))
            .and_then(|body| {
                let record = XlogRecord {
                    rmid: RM_XACT_ID,
                    info: XLOG_XACT_PREPARE,
                    origin: 0,
                    xid,
                    data: Bytes::from(body),
                };
                Ok(record.insert(self.shared.xlog.as_ref())?)
            });
        let lsn = match logged {
            Ok(lsn) => lsn,
            Err(e) => {
                self.shared.proc_array.release_dummy(dummy, Xid::INVALID);
                self.shared.twophase.forget(gid);
                return Err(e);
            }
        };
        if let Err(e) = self.shared.xlog.flush(lsn) {
            return Err(self.abandon_logged_transaction(xid, "PREPARE", e.into()));
        }
        metrics::counter!("meridian_xlog_records_total", "kind" => "PREPARE").increment(1);
        data.prepare_lsn = lsn;

        let moved = self
            .shared
            .locks
            .transfer_all(self.lock_owner, LockOwner(dummy as u32));
        tracing::debug!("prepare {}: {} lock(s) moved to dummy slot {}", gid, moved, dummy);
        Ok((data, dummy))
    }

    // ── Subtransactions ──

    pub(crate) fn start_subtransaction(&mut self) -> MeridianResult<()> {
        let frame = self.stack.current_mut();
        if frame.state != TransState::Default {
            tracing::warn!("start_subtransaction while in {} state", frame.state);
        }
        frame.state = TransState::InProgress;
        let (sub, parent) = self.sub_ids();
        self.callbacks
            .fire_subxact(SubXactEvent::StartSub, sub, parent)?;
        tracing::debug!(
            "backend {}: started subtransaction {} at level {}",
            self.proc.backend_id(),
            sub,
            self.stack.current().nesting_level
        );
        Ok(())
    }

    pub(crate) fn commit_subtransaction(&mut self) -> MeridianResult<()> {
        let state = self.stack.current().state;
        if state != TransState::InProgress {
            tracing::warn!("commit_subtransaction while in {} state", state);
        }
        let (sub, parent_sub) = self.sub_ids();
        self.stack.current_mut().state = TransState::Commit;

        let mut child = self.stack.pop()?;
        self.stack.merge_into_parent(&child);
        child.owner.transfer_to(&mut self.stack.current_mut().owner);

        let parent_level = self.stack.current().nesting_level;
        for d in self.pending_deletes.iter_mut() {
            if d.nesting_level > parent_level {
                d.nesting_level = parent_level;
            }
        }
        for (level, _) in self.pending_invals.iter_mut() {
            if *level > parent_level {
                *level = parent_level;
            }
        }
        for (level, _) in self.pending_deldbs.iter_mut() {
            if *level > parent_level {
                *level = parent_level;
            }
        }

        self.callbacks
            .fire_subxact_best_effort(SubXactEvent::CommitSub, sub, parent_sub);
        metrics::counter!("meridian_subxact_total", "action" => "commit").increment(1);
        tracing::debug!(
            "backend {}: committed subtransaction {} (xid {})",
            self.proc.backend_id(),
            sub,
            child.xid
        );
        Ok(())
    }

    pub(crate) fn abort_subtransaction(&mut self) {
        self.cancel.hold_interrupts();
        self.shared.locks.cancel_wait(self.lock_owner);
        self.proc.slot().set_wait_state(WaitState::None);

        let state = self.stack.current().state;
        if state != TransState::InProgress {
            tracing::warn!("abort_subtransaction while in {} state", state);
        }
        self.stack.current_mut().state = TransState::Abort;
        let (sub, parent_sub) = self.sub_ids();
        let level = self.stack.current().nesting_level;

        let latest = match self.record_transaction_abort(true) {
            Ok(latest) => latest,
            Err(e) => {
                tracing::error!("{}: {}", e.pg_severity(), e);
                Xid::INVALID
            }
        };
        let frame = self.stack.current();
        if frame.xid.is_valid() {
            let mut gone = Vec::with_capacity(frame.child_xids.len() + 1);
            gone.push(frame.xid);
            gone.extend_from_slice(&frame.child_xids);
            self.shared
                .proc_array
                .remove_subxids(self.proc.index(), &gone, latest);
        }

        let rels = self.take_pending_deletes(false, level);
        self.pending_deletes.retain(|d| d.nesting_level < level);
        self.pending_invals.retain(|(l, _)| *l < level);
        self.pending_deldbs.retain(|(l, _)| *l < level);
        self.drop_storage(&rels, &[], None);

        self.callbacks
            .fire_subxact_best_effort(SubXactEvent::AbortSub, sub, parent_sub);
        let locks = Arc::clone(&self.shared.locks);
        let owner = self.lock_owner;
        self.stack
            .current_mut()
            .owner
            .release_all_phases(false, false, locks.as_ref(), owner);
        metrics::counter!("meridian_subxact_total", "action" => "abort").increment(1);
        tracing::debug!(
            "backend {}: aborted subtransaction {}",
            self.proc.backend_id(),
            sub
        );
        self.cancel.resume_interrupts();
    }

    pub(crate) fn cleanup_subtransaction(&mut self) {
        let state = self.stack.current().state;
        if state != TransState::Abort {
            tracing::warn!("cleanup_subtransaction while in {} state", state);
        }
        if let Err(e) = self.stack.pop() {
            tracing::error!("{}", e);
        }
    }

    // ── Helpers ──

    fn sub_ids(&self) -> (SubXactId, SubXactId) {
        let frame = self.stack.current();
        let parent = frame
            .parent
            .map(|p| self.stack.frame(p).subxid)
            .unwrap_or(SubXactId::INVALID);
        (frame.subxid, parent)
    }

    fn release_top_owner(&mut self, phase: ReleasePhase, is_commit: bool) {
        let locks = Arc::clone(&self.shared.locks);
        let owner = self.lock_owner;
        self.stack
            .top_mut()
            .owner
            .release(phase, is_commit, true, locks.as_ref(), owner);
    }

    /// Relation files to delete if the transaction ends the `at_commit` way.
    pub(crate) fn pending_rels(&self, at_commit: bool) -> Vec<RelFileNode> {
        self.pending_deletes
            .iter()
            .filter(|d| d.at_commit == at_commit)
            .map(|d| d.rel)
            .collect()
    }

    /// Remove and return pending deletes of the given kind at `min_level` or
    /// deeper (0 = all).
    fn take_pending_deletes(&mut self, at_commit: bool, min_level: u32) -> Vec<RelFileNode> {
        let mut taken = Vec::new();
        self.pending_deletes.retain(|d| {
            if d.at_commit == at_commit && d.nesting_level >= min_level {
                taken.push(d.rel);
                false
            } else {
                true
            }
        });
        taken
    }

    fn take_pending_deldbs(&mut self) -> Vec<DbDirSpec> {
        self.pending_deldbs.drain(..).map(|(_, db)| db).collect()
    }

    pub(crate) fn drop_storage(
        &self,
        rels: &[RelFileNode],
        dbs: &[DbDirSpec],
        tablespace: Option<Oid>,
    ) {
        for rel in rels {
            if let Err(e) = self.shared.smgr.unlink_relation(*rel) {
                tracing::warn!("could not remove relation file {}: {}", rel, e);
            }
        }
        for db in dbs {
            if let Err(e) = self.shared.smgr.drop_database_dir(*db) {
                tracing::warn!(
                    "could not remove directory of database {}: {}",
                    db.database,
                    e
                );
            }
        }
        if let Some(spc) = tablespace {
            if let Err(e) = self.shared.smgr.drop_tablespace_dir(spc) {
                tracing::warn!("could not remove tablespace {}: {}", spc, e);
            }
        }
    }

    /// The outcome record of `xid` is in the log but the transaction could
    /// not be finished in memory. No contrary record may follow it, so the
    /// backend forgets the transaction without logging, its xid stays
    /// advertised as running, and the node refuses work until recovery
    /// settles the outcome from the log.
    pub(crate) fn abandon_logged_transaction(
        &mut self,
        xid: Xid,
        record: &'static str,
        cause: MeridianError,
    ) -> MeridianError {
        let err = self.shared.stop_for_recovery(
            XactError::OutcomeUnresolved {
                xid,
                record,
                reason: cause.to_string(),
            }
            .into(),
        );
        self.reset_after_transaction();
        err
    }

    /// Shared tail of commit, abort and prepare.
    fn end_of_transaction(&mut self, committed: bool) {
        self.shared
            .resource_group
            .on_xact_end(self.proc.backend_id(), committed);
        if let (Some(_), Some(session)) = (self.writer_slot(), self.options.session) {
            let removed = self.shared.snapshots.remove_cursor_files(session);
            if removed > 0 {
                tracing::debug!("removed {} cursor snapshot file(s)", removed);
            }
        }
    }

    /// Clear all per-transaction state; the stack is back to one idle frame.
    pub(crate) fn reset_after_transaction(&mut self) {
        self.stack.reset();
        self.command_id = CommandId::FIRST;
        self.command_id_used = false;
        self.unreported_xids.clear();
        self.force_sync = false;
        self.did_write = false;
        self.exported_snapshots = false;
        self.accessed_temp_rel = false;
        self.pending_deletes.clear();
        self.pending_invals.clear();
        self.pending_deldbs.clear();
        self.tablespace_to_delete = None;
        self.combocids.clear();
        self.prepare_gid = None;
        self.pre_commit.clear();
        self.distributed = None;
        self.replication_origin = None;
        self.proc.slot().set_lxid(LocalXid::INVALID);
        self.update_slot_xact_info();
    }
}
