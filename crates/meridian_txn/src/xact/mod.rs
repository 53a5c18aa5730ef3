//! Transaction management for one backend.
//!
//! A [`Backend`] owns the transaction state stack of one session and drives
//! it through the statement-boundary entry points in `block`; the low-level
//! start/commit/abort/prepare paths live in `lifecycle`, durable recording in
//! `record`.
//!
//! ```text
//!  start_transaction_command ─┐
//!                             ├─ block dispatch ─ lifecycle ─ record ─ xlog
//!  commit_transaction_command ┘                      │
//!                                                    └─ proc array / clog / locks
//! ```

mod block;
mod lifecycle;
mod record;
mod session;
pub mod state;

use std::sync::Arc;

use meridian_common::cancel::CancelToken;
use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{
    BackendId, CommandId, DbDirSpec, DistribXid, LocalXid, Lsn, Oid, RelFileNode, SessionId,
    SessionIdentity, SubXactId, TimestampTz, Xid,
};
use meridian_storage::xact_record::InvalidationMessage;

use crate::coordinator::{DistributedIdentity, DtxContext};
use crate::distrib_cache::LocalDistribXactCache;
use crate::hooks::{PreCommitQueue, XactCallbacks};
use crate::lock::{LockMode, LockOutcome, LockOwner, LockTag};
use crate::proc_array::{ProcHandle, WaitState};
use crate::shared::SharedState;
use crate::snapshot::ComboCid;

pub use session::TransactionHandle;
pub use state::{TBlockState, TransState, TransactionFrame, TransactionStack};

/// How a backend joins the node.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub pid: u32,
    pub identity: SessionIdentity,
    pub dtx_context: DtxContext,
    /// Distributed session this backend serves. A non-reader with a session
    /// is the session's writer and owns its shared snapshot slot.
    pub session: Option<SessionId>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            pid: std::process::id(),
            identity: SessionIdentity::default(),
            dtx_context: DtxContext::LocalOnly,
            session: None,
        }
    }
}

/// A relation file whose fate is decided at end of (sub)transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingDelete {
    pub rel: RelFileNode,
    /// Delete on commit (a dropped relation) rather than on abort (a
    /// relation created by this transaction).
    pub at_commit: bool,
    pub nesting_level: u32,
}

pub struct Backend {
    shared: Arc<SharedState>,
    proc: ProcHandle,
    options: BackendOptions,
    lock_owner: LockOwner,
    stack: TransactionStack,
    lxid: LocalXid,
    command_id: CommandId,
    command_id_used: bool,
    start_timestamp: TimestampTz,
    /// Sub-xids assigned but not yet covered by an assignment record.
    unreported_xids: Vec<Xid>,
    force_sync: bool,
    did_write: bool,
    exported_snapshots: bool,
    accessed_temp_rel: bool,
    pending_deletes: Vec<PendingDelete>,
    pending_invals: Vec<(u32, InvalidationMessage)>,
    pending_deldbs: Vec<(u32, DbDirSpec)>,
    tablespace_to_delete: Option<Oid>,
    combocids: Vec<ComboCid>,
    prepare_gid: Option<String>,
    callbacks: XactCallbacks,
    pre_commit: PreCommitQueue,
    distrib_cache: LocalDistribXactCache,
    cancel: CancelToken,
    /// Writer: the slot it owns. Reader: the writer's slot.
    snapshot_slot: Option<usize>,
    segmate_sync: u32,
    distributed: Option<DistributedIdentity>,
    qd_cid: CommandId,
    replication_origin: Option<(u16, Lsn, TimestampTz)>,
}

impl Backend {
    /// Attach to the node: claim a process slot and, for a distributed
    /// session, the shared snapshot slot (writer) or the writer's slot
    /// (reader, waits for the writer to appear).
    pub fn connect(shared: &Arc<SharedState>, options: BackendOptions) -> MeridianResult<Self> {
        let proc = shared.proc_array.acquire(
            options.pid,
            options.identity.database,
            options.identity.role,
        )?;
        let cancel = CancelToken::new();
        let snapshot_slot = match options.session {
            Some(session) if options.dtx_context.is_reader() => {
                Some(shared.snapshots.lookup(session, &cancel)?)
            }
            Some(session) => Some(shared.snapshots.add(
                session,
                options.pid,
                proc.backend_id(),
                &cancel,
            )?),
            None => None,
        };
        let config = shared.config();
        let lock_owner = LockOwner(proc.index() as u32);
        tracing::debug!(
            "backend {} connected (pid {}, {:?}, session {:?})",
            proc.backend_id(),
            options.pid,
            options.dtx_context,
            options.session
        );
        Ok(Self {
            stack: TransactionStack::new(&config.xact),
            distrib_cache: LocalDistribXactCache::new(config.distrib_cache.capacity),
            shared: Arc::clone(shared),
            proc,
            options,
            lock_owner,
            lxid: LocalXid::INVALID,
            command_id: CommandId::FIRST,
            command_id_used: false,
            start_timestamp: TimestampTz(0),
            unreported_xids: Vec::new(),
            force_sync: false,
            did_write: false,
            exported_snapshots: false,
            accessed_temp_rel: false,
            pending_deletes: Vec::new(),
            pending_invals: Vec::new(),
            pending_deldbs: Vec::new(),
            tablespace_to_delete: None,
            combocids: Vec::new(),
            prepare_gid: None,
            callbacks: XactCallbacks::default(),
            pre_commit: PreCommitQueue::default(),
            cancel,
            snapshot_slot,
            segmate_sync: 0,
            distributed: None,
            qd_cid: CommandId::FIRST,
            replication_origin: None,
        })
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn backend_id(&self) -> BackendId {
        self.proc.backend_id()
    }

    pub fn proc_index(&self) -> usize {
        self.proc.index()
    }

    pub fn dtx_context(&self) -> DtxContext {
        self.options.dtx_context
    }

    pub fn set_dtx_context(&mut self, context: DtxContext) {
        self.options.dtx_context = context;
    }

    /// Token that cancels this backend's waits. Clone it to cancel from
    /// another thread.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn callbacks_mut(&mut self) -> &mut XactCallbacks {
        &mut self.callbacks
    }

    pub fn pre_commit_mut(&mut self) -> &mut PreCommitQueue {
        &mut self.pre_commit
    }

    pub fn distrib_cache(&self) -> &LocalDistribXactCache {
        &self.distrib_cache
    }

    pub fn is_writer(&self) -> bool {
        self.options.session.is_some() && !self.options.dtx_context.is_reader()
    }

    fn writer_slot(&self) -> Option<usize> {
        if self.is_writer() {
            self.snapshot_slot
        } else {
            None
        }
    }

    // ── Transaction ids ──

    /// Top-level xid, assigning one if needed.
    pub fn get_top_transaction_id(&mut self) -> MeridianResult<Xid> {
        if !self.stack.top().xid.is_valid() {
            self.assign_frame_xids(0)?;
        }
        Ok(self.stack.top().xid)
    }

    pub fn get_top_transaction_id_if_any(&self) -> Option<Xid> {
        let xid = self.stack.top().xid;
        xid.is_valid().then_some(xid)
    }

    /// Xid of the innermost open (sub)transaction, assigning one if needed.
    pub fn get_current_transaction_id(&mut self) -> MeridianResult<Xid> {
        if !self.stack.current().xid.is_valid() {
            self.assign_frame_xids(self.stack.current_index())?;
        }
        Ok(self.stack.current().xid)
    }

    pub fn get_current_transaction_id_if_any(&self) -> Option<Xid> {
        let xid = self.stack.current().xid;
        xid.is_valid().then_some(xid)
    }

    pub fn get_current_sub_transaction_id(&self) -> SubXactId {
        self.stack.current().subxid
    }

    pub fn get_current_transaction_nest_level(&self) -> u32 {
        self.stack.current().nesting_level
    }

    pub fn get_current_lxid(&self) -> LocalXid {
        self.lxid
    }

    pub fn transaction_start_timestamp(&self) -> TimestampTz {
        self.start_timestamp
    }

    /// Assign xids to frame `index` and every unassigned ancestor, outermost
    /// first, so a child's xid always follows its parent's.
    fn assign_frame_xids(&mut self, index: usize) -> MeridianResult<()> {
        if self.options.dtx_context.is_reader() {
            return Err(XactError::ReaderCannotAssignXid.into());
        }
        let mut pending = Vec::new();
        let mut next = Some(index);
        while let Some(i) = next {
            let frame = self.stack.frame(i);
            if frame.xid.is_valid() {
                break;
            }
            pending.push(i);
            next = frame.parent;
        }
        for &i in pending.iter().rev() {
            self.assign_transaction_id(i)?;
        }
        Ok(())
    }

    fn assign_transaction_id(&mut self, index: usize) -> MeridianResult<()> {
        let frame = self.stack.frame(index);
        if frame.state != TransState::InProgress {
            return Err(MeridianError::invalid_state(
                "assign_transaction_id",
                frame.state,
            ));
        }
        let is_top = frame.parent.is_none();
        let parent_xid = frame.parent.map(|p| self.stack.frame(p).xid);
        let nesting_level = frame.nesting_level;

        let slot = self.proc.slot();
        let max_cached = self.shared.proc_array.max_cached_subxids();
        let xid = self.shared.xids.allocate(|xid| {
            if is_top {
                slot.set_xid(xid);
            } else {
                slot.add_subxid(xid, max_cached);
            }
        });
        if let Some(parent) = parent_xid {
            self.shared.subtrans.set_parent(xid, parent);
        }
        self.stack.frame_mut(index).xid = xid;

        let tag = LockTag::Transaction(xid);
        if self.shared.locks.acquire(self.lock_owner, tag, LockMode::Exclusive) != LockOutcome::Granted {
            return Err(MeridianError::internal_bug(
                "XACT-ASSIGN-001",
                format!("could not lock freshly assigned xid {}", xid),
                format!("backend={}", self.proc.backend_id()),
            ));
        }
        self.stack.frame_mut(index).owner.remember_lock(tag);

        if is_top {
            if self.options.dtx_context.is_coordinator() && self.distributed.is_none() {
                self.distributed = Some(self.shared.coordinator.create_distributed_xid());
            }
            if let Some(identity) = self.distributed {
                self.proc
                    .slot()
                    .local_distrib
                    .start(identity.timestamp, identity.xid)?;
            }
            self.update_slot_xact_info();
        } else {
            self.unreported_xids.push(xid);
            let config = &self.shared.config().xact;
            if config.standby_logging && self.unreported_xids.len() >= config.assignment_batch_size {
                self.log_assignment()?;
            }
        }
        tracing::debug!(
            "backend {}: assigned xid {} at nesting level {}",
            self.proc.backend_id(),
            xid,
            nesting_level
        );
        Ok(())
    }

    /// Refresh the writer's shared snapshot slot with the current
    /// transaction fields.
    fn update_slot_xact_info(&self) {
        if let Some(idx) = self.writer_slot() {
            self.shared.snapshots.update_xact_info(
                idx,
                self.stack.top().xid,
                self.command_id,
                self.start_timestamp,
                self.distributed_xid(),
            );
        }
    }

    fn distributed_xid(&self) -> DistribXid {
        self.distributed
            .map(|d| d.xid)
            .unwrap_or(DistribXid::INVALID)
    }

    /// Whether `xid` is this backend's transaction or one of its live
    /// subtransactions. A reader answers for its writer.
    pub fn transaction_id_is_current(&self, xid: Xid) -> bool {
        if self.options.dtx_context.is_reader() {
            return self.reader_is_current(xid);
        }
        self.stack.is_current(xid)
    }

    fn reader_is_current(&self, xid: Xid) -> bool {
        let Some(idx) = self.snapshot_slot else {
            return false;
        };
        let writer_xid = self.shared.snapshots.slot_xid(idx);
        if !writer_xid.is_valid() || !xid.is_normal() {
            return false;
        }
        if xid == writer_xid {
            return true;
        }
        self.shared.subtrans.topmost(xid) == writer_xid && !self.shared.clog.did_abort(xid)
    }

    pub fn transaction_stack(&self) -> &TransactionStack {
        &self.stack
    }

    /// Committed subtransaction xids of the current frame.
    pub fn committed_children(&self) -> &[Xid] {
        &self.stack.current().child_xids
    }

    // ── Command ids ──

    pub fn command_counter_increment(&mut self) -> MeridianResult<()> {
        if !self.command_id_used {
            return Ok(());
        }
        if self.command_id.0 >= CommandId::INVALID.0 - 1 {
            return Err(XactError::TooManyCommands.into());
        }
        self.command_id = CommandId(self.command_id.0 + 1);
        self.command_id_used = false;
        self.update_slot_xact_info();
        Ok(())
    }

    /// Current command id; `used` marks it as having modified data so the
    /// next increment takes effect.
    pub fn get_current_command_id(&mut self, used: bool) -> CommandId {
        if used {
            self.command_id_used = true;
        }
        self.command_id
    }

    /// Current command id without marking it used.
    pub fn current_command_id(&self) -> CommandId {
        self.command_id
    }

    /// Combo command id for a tuple both inserted and deleted here.
    pub fn combo_cid(&mut self, cmin: CommandId, cmax: CommandId) -> CommandId {
        let pair = ComboCid { cmin, cmax };
        let pos = match self.combocids.iter().position(|c| *c == pair) {
            Some(p) => p,
            None => {
                self.combocids.push(pair);
                self.combocids.len() - 1
            }
        };
        CommandId(pos as u32)
    }

    // ── Transaction block queries ──

    pub fn block_state(&self) -> TBlockState {
        self.stack.current().block_state
    }

    pub fn trans_state(&self) -> TransState {
        self.stack.current().state
    }

    pub fn is_transaction_block(&self) -> bool {
        !matches!(
            self.stack.top().block_state,
            TBlockState::Default | TBlockState::Started
        )
    }

    pub fn is_transaction_or_transaction_block(&self) -> bool {
        self.stack.top().block_state != TBlockState::Default
    }

    pub fn is_sub_transaction(&self) -> bool {
        !self.stack.is_top_level()
    }

    /// Reject statements that may not run inside a transaction block.
    pub fn prevent_transaction_chain(&self, stmt: &'static str) -> MeridianResult<()> {
        if self.is_transaction_block() || self.is_sub_transaction() {
            return Err(XactError::InsideTransactionBlock(stmt).into());
        }
        Ok(())
    }

    /// Reject statements that only make sense inside a transaction block.
    pub fn require_transaction_chain(&self, stmt: &'static str) -> MeridianResult<()> {
        if self.is_transaction_block() || self.is_sub_transaction() {
            Ok(())
        } else {
            Err(XactError::NoTransactionBlock(stmt).into())
        }
    }

    pub fn show_transaction_state(&self, context: &str) -> String {
        let out = self.stack.describe();
        tracing::debug!("{}:\n{}", context, out);
        out
    }

    // ── Things a transaction may do ──

    /// The executor wrote data: a coordinator will need two-phase commit.
    pub fn executor_mark_transaction_does_writes(&mut self) {
        self.did_write = true;
    }

    pub fn did_write(&self) -> bool {
        self.did_write
    }

    /// Make this transaction's commit record synchronous.
    pub fn force_sync_commit(&mut self) {
        self.force_sync = true;
    }

    pub fn mark_exported_snapshot(&mut self) {
        self.exported_snapshots = true;
    }

    pub fn mark_temp_relation_access(&mut self) {
        self.accessed_temp_rel = true;
    }

    /// Take `tag` for the current (sub)transaction, waiting if needed.
    pub fn lock(&mut self, tag: LockTag, mode: LockMode) -> MeridianResult<()> {
        self.proc.slot().set_wait_state(WaitState::Lock);
        let result = self
            .shared
            .locks
            .lock(self.lock_owner, tag, mode, &self.cancel);
        self.proc.slot().set_wait_state(WaitState::None);
        result?;
        self.stack.current_mut().owner.remember_lock(tag);
        Ok(())
    }

    /// Wait until `xid` and, if it was a subtransaction, its parents have
    /// finished.
    pub fn wait_for_transaction(&mut self, xid: Xid) -> MeridianResult<()> {
        let mut xid = xid;
        loop {
            if self.stack.is_current(xid) {
                return Err(MeridianError::internal_bug(
                    "XACT-WAIT-001",
                    "waiting for own transaction",
                    format!("xid={}", xid),
                ));
            }
            let tag = LockTag::Transaction(xid);
            self.proc.slot().set_wait_state(WaitState::Lock);
            let result = self
                .shared
                .locks
                .lock(self.lock_owner, tag, LockMode::Share, &self.cancel);
            self.proc.slot().set_wait_state(WaitState::None);
            result?;
            self.shared.locks.release(self.lock_owner, tag);
            if !self.shared.xid_in_progress(xid) {
                return Ok(());
            }
            match self.shared.subtrans.parent(xid) {
                Some(parent) if parent.is_valid() => xid = parent,
                _ => return Ok(()),
            }
        }
    }

    /// Drop relation `rel` when the transaction commits.
    pub fn schedule_relation_drop(&mut self, rel: RelFileNode) {
        let nesting_level = self.stack.current().nesting_level;
        self.pending_deletes.push(PendingDelete {
            rel,
            at_commit: true,
            nesting_level,
        });
    }

    /// `rel` was created by this transaction: delete it if the transaction
    /// (or the creating subtransaction) aborts.
    pub fn register_created_relation(&mut self, rel: RelFileNode) {
        let nesting_level = self.stack.current().nesting_level;
        self.pending_deletes.push(PendingDelete {
            rel,
            at_commit: false,
            nesting_level,
        });
    }

    pub fn schedule_database_drop(&mut self, db: DbDirSpec) {
        let level = self.stack.current().nesting_level;
        self.pending_deldbs.push((level, db));
    }

    pub fn schedule_tablespace_drop(&mut self, spc: Oid) {
        self.tablespace_to_delete = Some(spc);
    }

    pub fn add_invalidation(&mut self, msg: InvalidationMessage) {
        let level = self.stack.current().nesting_level;
        self.pending_invals.push((level, msg));
    }

    /// Changes of this transaction are being replayed from replication
    /// origin `origin`, up to `lsn`.
    pub fn set_replication_origin(&mut self, origin: u16, lsn: Lsn, timestamp: TimestampTz) {
        self.replication_origin = Some((origin, lsn, timestamp));
    }

    /// Executor side: attach the coordinator's distributed transaction.
    pub fn set_distributed_identity(
        &mut self,
        identity: DistributedIdentity,
        qd_cid: CommandId,
    ) -> MeridianResult<()> {
        self.distributed = Some(identity);
        self.qd_cid = qd_cid;
        if self.stack.top().xid.is_valid() {
            let ld = &self.proc.slot().local_distrib;
            if ld.state() == crate::local_distrib::LocalDistribXactState::None {
                ld.start(identity.timestamp, identity.xid)?;
            }
        }
        self.update_slot_xact_info();
        Ok(())
    }

    pub fn distributed_identity(&self) -> Option<DistributedIdentity> {
        self.distributed
    }

    /// Distributed xid a committed local xid belongs to, through the
    /// backend's cache.
    pub fn distributed_xid_of(&mut self, xid: Xid) -> Option<DistribXid> {
        if let Some(dxid) = self.distrib_cache.find(xid) {
            metrics::counter!("meridian_distrib_cache_hits_total").increment(1);
            return Some(dxid);
        }
        metrics::counter!("meridian_distrib_cache_misses_total").increment(1);
        let entry = self.shared.distributed_log.committed_check(xid)?;
        self.distrib_cache.add(xid, entry.distrib_xid);
        Some(entry.distrib_xid)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.abort_out_of_any_transaction();
        if let (Some(idx), Some(session)) = (self.writer_slot(), self.options.session) {
            if let Err(e) = self.shared.snapshots.remove(idx, session) {
                tracing::warn!("backend {}: {}", self.proc.backend_id(), e);
            }
            self.shared.snapshots.remove_cursor_files(session);
        }
        if self.shared.config().distrib_cache.log_stats {
            self.distrib_cache.show_stats("backend exit");
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("backend_id", &self.proc.backend_id())
            .field("dtx_context", &self.options.dtx_context)
            .field("block_state", &self.stack.current().block_state)
            .field("state", &self.stack.current().state)
            .field("xid", &self.stack.top().xid)
            .finish()
    }
}
