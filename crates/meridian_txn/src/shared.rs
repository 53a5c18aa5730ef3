//! Node-wide transaction state shared by every backend.
//!
//! `SharedState` is built once at node start, handed to each backend as an
//! `Arc`, and shut down explicitly. Nothing in the transaction core lives in
//! process-wide statics.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use meridian_common::config::MeridianConfig;
use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{LocalXid, Lsn, TimestampTz, Xid};
use meridian_storage::{
    CommitLog, DistributedLog, DurableLog, FileLog, FsStorageManager, MemLog, NullStorageManager,
    StorageManager, SubTransLog, XidStatus,
};
use parking_lot::Mutex;

use crate::coordinator::{DtxCoordinator, LocalOnlyCoordinator};
use crate::hooks::{NoopResourceGroup, ResourceGroupHook};
use crate::known_assigned::KnownAssignedXids;
use crate::lock::{InProcessLockManager, LockManager, LockOutcome, LockOwner};
use crate::proc_array::ProcArray;
use crate::redo::{self, RedoMode, RedoStats};
use crate::shared_snapshot::SharedSnapshotTable;
use crate::twophase::TwoPhaseState;

/// Hands out xids. The only structure every backend writes to.
pub struct XidGenerator {
    next: Mutex<Xid>,
}

impl XidGenerator {
    pub fn new(first: Xid) -> Self {
        Self {
            next: Mutex::new(if first.is_normal() {
                first
            } else {
                Xid::FIRST_NORMAL
            }),
        }
    }

    /// Allocate the next xid. `publish` runs while the allocation lock is
    /// still held, so the xid is visible in the process array before any
    /// later xid can be handed out.
    pub fn allocate(&self, publish: impl FnOnce(Xid)) -> Xid {
        let mut next = self.next.lock();
        let xid = *next;
        *next = xid.advance();
        publish(xid);
        xid
    }

    pub fn next_xid(&self) -> Xid {
        *self.next.lock()
    }

    /// Make sure `xid` is never handed out again.
    pub fn advance_past(&self, xid: Xid) {
        if !xid.is_normal() {
            return;
        }
        let mut next = self.next.lock();
        if xid.follows_or_equals(*next) {
            *next = xid.advance();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginProgress {
    pub lsn: Lsn,
    pub timestamp: TimestampTz,
}

/// How far changes from each replication origin have been applied.
#[derive(Default)]
pub struct ReplicationOrigins {
    progress: DashMap<u16, OriginProgress>,
}

impl ReplicationOrigins {
    /// Move `origin` forward; an older position is ignored.
    pub fn advance(&self, origin: u16, lsn: Lsn, timestamp: TimestampTz) {
        let mut entry = self.progress.entry(origin).or_insert(OriginProgress {
            lsn: Lsn::INVALID,
            timestamp: TimestampTz(0),
        });
        if lsn > entry.lsn {
            *entry = OriginProgress { lsn, timestamp };
        }
    }

    pub fn progress(&self, origin: u16) -> Option<OriginProgress> {
        self.progress.get(&origin).map(|p| *p)
    }
}

pub struct SharedState {
    config: MeridianConfig,
    pub xids: XidGenerator,
    next_lxid: AtomicU32,
    pub proc_array: Arc<ProcArray>,
    pub snapshots: SharedSnapshotTable,
    pub clog: CommitLog,
    pub subtrans: SubTransLog,
    pub distributed_log: DistributedLog,
    pub known_assigned: KnownAssignedXids,
    pub twophase: TwoPhaseState,
    pub origins: ReplicationOrigins,
    pub xlog: Arc<dyn DurableLog>,
    pub smgr: Arc<dyn StorageManager>,
    pub locks: Arc<dyn LockManager>,
    pub coordinator: Arc<dyn DtxCoordinator>,
    pub resource_group: Arc<dyn ResourceGroupHook>,
    in_recovery: AtomicBool,
    shut_down: AtomicBool,
    needs_restart: AtomicBool,
}

pub struct SharedStateBuilder {
    config: MeridianConfig,
    persistent: bool,
    xlog: Option<Arc<dyn DurableLog>>,
    smgr: Option<Arc<dyn StorageManager>>,
    locks: Option<Arc<dyn LockManager>>,
    coordinator: Option<Arc<dyn DtxCoordinator>>,
    resource_group: Option<Arc<dyn ResourceGroupHook>>,
}

impl SharedStateBuilder {
    pub fn new(config: MeridianConfig) -> Self {
        Self {
            config,
            persistent: false,
            xlog: None,
            smgr: None,
            locks: None,
            coordinator: None,
            resource_group: None,
        }
    }

    /// Keep the log, relation files and two-phase state under the
    /// configured data directory.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn xlog(mut self, xlog: Arc<dyn DurableLog>) -> Self {
        self.xlog = Some(xlog);
        self
    }

    pub fn storage_manager(mut self, smgr: Arc<dyn StorageManager>) -> Self {
        self.smgr = Some(smgr);
        self
    }

    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn DtxCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn resource_group(mut self, hook: Arc<dyn ResourceGroupHook>) -> Self {
        self.resource_group = Some(hook);
        self
    }

    pub fn build(self) -> MeridianResult<Arc<SharedState>> {
        let config = self.config;
        config.validate()?;
        let data_dir = config.data_dir();
        if self.persistent {
            std::fs::create_dir_all(&data_dir).map_err(meridian_common::error::WalError::from)?;
        }

        let xlog: Arc<dyn DurableLog> = match self.xlog {
            Some(x) => x,
            None if self.persistent => Arc::new(FileLog::open(&data_dir, config.wal.sync_mode)?),
            None => Arc::new(MemLog::new()),
        };
        let smgr: Arc<dyn StorageManager> = match self.smgr {
            Some(s) => s,
            None if self.persistent => Arc::new(FsStorageManager::new(&data_dir)),
            None => Arc::new(NullStorageManager),
        };
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(InProcessLockManager::new(&config.lock)));
        let coordinator = self
            .coordinator
            .unwrap_or_else(|| Arc::new(LocalOnlyCoordinator::default()));
        let resource_group = self
            .resource_group
            .unwrap_or_else(|| Arc::new(NoopResourceGroup));
        let twophase = TwoPhaseState::new(
            config.xact.max_prepared_transactions,
            self.persistent.then_some(data_dir.as_path()),
        )?;

        let proc_array = Arc::new(ProcArray::new(
            config.proc.max_backends,
            config.xact.max_prepared_transactions,
            config.proc.max_cached_subxids,
        ));
        let snapshots = SharedSnapshotTable::new(&config);
        tracing::info!(
            "shared state: {} backends, {} prepared, {} snapshot slots",
            config.proc.max_backends,
            config.xact.max_prepared_transactions,
            snapshots.max_slots()
        );

        Ok(Arc::new(SharedState {
            xids: XidGenerator::new(Xid::FIRST_NORMAL),
            next_lxid: AtomicU32::new(1),
            proc_array,
            snapshots,
            clog: CommitLog::new(),
            subtrans: SubTransLog::new(),
            distributed_log: DistributedLog::new(),
            known_assigned: KnownAssignedXids::new(),
            twophase,
            origins: ReplicationOrigins::default(),
            xlog,
            smgr,
            locks,
            coordinator,
            resource_group,
            in_recovery: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            needs_restart: AtomicBool::new(false),
            config,
        }))
    }
}

impl SharedState {
    /// Volatile node: in-memory log, no relation files.
    pub fn in_memory(config: MeridianConfig) -> MeridianResult<Arc<Self>> {
        SharedStateBuilder::new(config).build()
    }

    /// Open the data directory and recover.
    pub fn open(config: MeridianConfig) -> MeridianResult<Arc<Self>> {
        let shared = SharedStateBuilder::new(config).persistent().build()?;
        shared.startup_recovery()?;
        Ok(shared)
    }

    pub fn config(&self) -> &MeridianConfig {
        &self.config
    }

    pub fn is_in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Set once a transaction outcome is in the log but could not be
    /// completed in memory. Only crash recovery can settle it.
    pub fn needs_restart(&self) -> bool {
        self.needs_restart.load(Ordering::Acquire)
    }

    /// Stop accepting transactions. Returns the error for the caller.
    pub(crate) fn stop_for_recovery(&self, err: MeridianError) -> MeridianError {
        self.needs_restart.store(true, Ordering::Release);
        metrics::counter!("meridian_node_panics_total").increment(1);
        tracing::error!("{}: {}; node must restart", err.pg_severity(), err);
        err
    }

    pub(crate) fn check_usable(&self) -> MeridianResult<()> {
        if self.needs_restart() {
            return Err(XactError::NodeNeedsRestart.into());
        }
        Ok(())
    }

    pub fn allocate_lxid(&self) -> LocalXid {
        loop {
            let v = self.next_lxid.fetch_add(1, Ordering::Relaxed);
            if v != LocalXid::INVALID.0 {
                return LocalXid(v);
            }
        }
    }

    /// Whether `xid` is still running anywhere on this node.
    pub fn xid_in_progress(&self, xid: Xid) -> bool {
        if self.proc_array.is_in_progress(xid, &self.subtrans) {
            return true;
        }
        self.is_in_recovery() && self.known_assigned.contains(self.subtrans.topmost(xid))
    }

    pub fn xid_did_commit(&self, xid: Xid) -> bool {
        self.clog.did_commit(xid, &self.subtrans)
    }

    /// Rebuild state from the durable log and two-phase state files, then
    /// reinstate prepared transactions.
    pub fn startup_recovery(&self) -> MeridianResult<RedoStats> {
        self.in_recovery.store(true, Ordering::Release);
        let result = self.run_recovery();
        self.in_recovery.store(false, Ordering::Release);
        result
    }

    fn run_recovery(&self) -> MeridianResult<RedoStats> {
        for data in self.twophase.read_state_files()? {
            self.xids.advance_past(meridian_storage::xact_record::latest_of(data.xid, &data.subxids));
            self.twophase.recreate(data);
        }
        let stats = redo::replay(self, Lsn::INVALID, RedoMode::Crash)?;

        // A state file left behind by a crash after its transaction finished.
        for data in self.twophase.list() {
            match self.clog.status(data.xid) {
                XidStatus::Committed | XidStatus::Aborted => {
                    tracing::warn!(
                        "recovery: removing stale two-phase state of finished xid {}",
                        data.xid
                    );
                    self.twophase.remove(&data.gid);
                }
                _ => {}
            }
        }
        let recovered = self.recover_prepared_transactions()?;
        tracing::info!(
            "recovery complete: {} records replayed, {} prepared transactions, next xid {}",
            stats.records,
            recovered,
            self.xids.next_xid()
        );
        Ok(stats)
    }

    /// Give every recovered prepared transaction a dummy process slot and
    /// its locks back. Returns how many were reinstated.
    pub fn recover_prepared_transactions(&self) -> MeridianResult<usize> {
        let pending = self.twophase.without_dummy();
        for data in &pending {
            for &sub in &data.subxids {
                self.subtrans.set_parent(sub, data.xid);
            }
            let dummy = self.proc_array.acquire_dummy(
                data.xid,
                &data.subxids,
                data.database,
                data.owner,
            )?;
            let owner = LockOwner(dummy as u32);
            for &(tag, mode) in &data.locks {
                if self.locks.acquire(owner, tag, mode) != LockOutcome::Granted {
                    tracing::warn!(
                        "recovery: could not re-acquire {} for prepared transaction {}",
                        tag,
                        data.gid
                    );
                }
            }
            self.twophase.set_dummy_proc(&data.gid, dummy);
            tracing::info!(
                "recovering prepared transaction {} (xid {})",
                data.gid,
                data.xid
            );
        }
        Ok(pending.len())
    }

    /// Flush the log and refuse further work.
    pub fn shutdown(&self) -> MeridianResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.xlog.flush(self.xlog.end_lsn())?;
        tracing::info!(
            "shared state shut down: {} backends still attached, {} prepared transactions",
            self.proc_array.member_count(),
            self.twophase.len()
        );
        Ok(())
    }
}
