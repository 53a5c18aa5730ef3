//! Replay of transaction log records.
//!
//! Crash recovery replays every record from the start of the log; a hot
//! standby additionally tracks which xids the primary has handed out so its
//! snapshots can treat them as running.
//!
//! Ordering per commit record: distributed log, then commit log, then
//! (after the log is flushed up to the record) file deletions.

use meridian_common::error::{MeridianResult, RedoError, TwoPhaseError, WalError};
use meridian_common::types::{DbDirSpec, Lsn, Oid, RelFileNode, Xid};
use meridian_storage::xact_record::{
    latest_of, AbortRecord, AssignmentRecord, CommitRecord, DistributedForgetRecord,
    XactRecordKind, XLOG_XACT_HAS_INFO, XLOG_XACT_OPMASK,
};
use meridian_storage::xlog::{RM_XACT_ID, XLOG_HEADER_SIZE};
use meridian_storage::{XidStatus, XlogRecord};

use crate::shared::SharedState;
use crate::twophase::GlobalTransactionData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoMode {
    /// Startup after a crash: rebuild commit state only.
    Crash,
    /// Hot standby: also maintain the known-assigned xids.
    Standby,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedoStats {
    pub records: u64,
    pub commits: u64,
    pub aborts: u64,
    pub prepares: u64,
    pub assignments: u64,
    pub forgets: u64,
    /// Position just past the last record replayed.
    pub end_lsn: Lsn,
}

/// Replay every record from `from` (the start of the log if invalid) to the
/// end of the log.
pub fn replay(shared: &SharedState, from: Lsn, mode: RedoMode) -> MeridianResult<RedoStats> {
    let mut stats = RedoStats::default();
    let mut lsn = if from.0 < XLOG_HEADER_SIZE {
        Lsn(XLOG_HEADER_SIZE)
    } else {
        from
    };
    while let Some((payload, next)) = shared.xlog.read_at(lsn)? {
        let record = XlogRecord::decode(&payload).map_err(|e| RedoError::Malformed {
            lsn,
            reason: e.to_string(),
        })?;
        if record.rmid != RM_XACT_ID {
            return Err(RedoError::UnknownRmgr(record.rmid).into());
        }
        let kind = xact_redo(shared, lsn, next, &record, mode)?;
        match kind {
            XactRecordKind::Commit
            | XactRecordKind::CommitPrepared
            | XactRecordKind::DistributedCommit => stats.commits += 1,
            XactRecordKind::Abort | XactRecordKind::AbortPrepared => stats.aborts += 1,
            XactRecordKind::Prepare => stats.prepares += 1,
            XactRecordKind::Assignment => stats.assignments += 1,
            XactRecordKind::DistributedForget => stats.forgets += 1,
        }
        metrics::counter!("meridian_redo_records_total", "kind" => kind.name()).increment(1);
        stats.records += 1;
        lsn = next;
    }
    stats.end_lsn = lsn;
    tracing::debug!(
        "redo: {} records ({} commits, {} aborts, {} prepares) up to {}",
        stats.records,
        stats.commits,
        stats.aborts,
        stats.prepares,
        lsn
    );
    Ok(stats)
}

/// Apply one transaction record at `lsn`; `end_lsn` is the position just
/// past it.
pub fn xact_redo(
    shared: &SharedState,
    lsn: Lsn,
    end_lsn: Lsn,
    record: &XlogRecord,
    mode: RedoMode,
) -> MeridianResult<XactRecordKind> {
    let info = record.info;
    if info & !(XLOG_XACT_OPMASK | XLOG_XACT_HAS_INFO) != 0 {
        return Err(RedoError::UnknownOpcode { info, lsn }.into());
    }
    let malformed = |e: WalError| RedoError::Malformed {
        lsn,
        reason: e.to_string(),
    };
    let kind = XactRecordKind::from_info(info);
    match kind {
        XactRecordKind::Commit | XactRecordKind::DistributedCommit => {
            let rec = CommitRecord::decode(info, &record.data).map_err(malformed)?;
            redo_commit(shared, record.xid, &rec, record.origin, end_lsn, mode)?;
        }
        XactRecordKind::CommitPrepared => {
            let rec = CommitRecord::decode(info, &record.data).map_err(malformed)?;
            let xid = rec.twophase_xid.unwrap_or(record.xid);
            redo_commit(shared, xid, &rec, record.origin, end_lsn, mode)?;
            forget_prepared(shared, xid)?;
        }
        XactRecordKind::Abort => {
            let rec = AbortRecord::decode(info, &record.data).map_err(malformed)?;
            redo_abort(shared, record.xid, &rec, record.origin, end_lsn, mode)?;
        }
        XactRecordKind::AbortPrepared => {
            let rec = AbortRecord::decode(info, &record.data).map_err(malformed)?;
            let xid = rec.twophase_xid.unwrap_or(record.xid);
            redo_abort(shared, xid, &rec, record.origin, end_lsn, mode)?;
            forget_prepared(shared, xid)?;
        }
        XactRecordKind::Prepare => {
            let mut data: GlobalTransactionData = bincode::deserialize(&record.data)
                .map_err(|e| RedoError::Malformed {
                    lsn,
                    reason: e.to_string(),
                })?;
            data.prepare_lsn = lsn;
            let latest = latest_of(data.xid, &data.subxids);
            shared.xids.advance_past(latest);
            if mode == RedoMode::Standby {
                shared.known_assigned.record_assigned(latest);
            }
            for &sub in &data.subxids {
                shared.subtrans.set_parent(sub, data.xid);
            }
            shared.twophase.recreate(data);
        }
        XactRecordKind::Assignment => {
            let rec = AssignmentRecord::decode(&record.data).map_err(malformed)?;
            for &sub in &rec.xsub {
                shared.subtrans.set_parent(sub, rec.xtop);
            }
            let latest = latest_of(rec.xtop, &rec.xsub);
            shared.xids.advance_past(latest);
            if mode == RedoMode::Standby {
                shared.known_assigned.record_assigned(latest);
                // The sub-transaction log answers for these from now on.
                shared.known_assigned.remove(&rec.xsub);
            }
        }
        XactRecordKind::DistributedForget => {
            let rec = DistributedForgetRecord::decode(&record.data).map_err(malformed)?;
            tracing::debug!(
                "redo: distributed transaction {}-{} forgotten",
                rec.distrib_timestamp,
                rec.distrib_xid
            );
        }
    }
    Ok(kind)
}

fn redo_commit(
    shared: &SharedState,
    xid: Xid,
    rec: &CommitRecord,
    origin: u16,
    end_lsn: Lsn,
    mode: RedoMode,
) -> MeridianResult<()> {
    let latest = rec.latest_xid(xid);
    shared.xids.advance_past(latest);
    if mode == RedoMode::Standby {
        shared.known_assigned.record_assigned(latest);
    }

    if let Some(d) = rec.distrib {
        shared.distributed_log.set_committed_tree(
            xid,
            &rec.subxacts,
            d.distrib_timestamp,
            d.distrib_xid,
            true,
        )?;
    }
    shared
        .clog
        .set_tree_status(xid, &rec.subxacts, XidStatus::Committed, Lsn::INVALID);

    if let Some(o) = rec.origin {
        shared.origins.advance(origin, o.origin_lsn, o.origin_timestamp);
    }
    if mode == RedoMode::Standby {
        shared.known_assigned.expire_tree(xid, &rec.subxacts);
    }
    shared.proc_array.set_latest_completed_xid(latest);

    drop_files(
        shared,
        end_lsn,
        &rec.xnodes,
        &rec.deldbs,
        rec.tablespace_to_delete,
    )
}

fn redo_abort(
    shared: &SharedState,
    xid: Xid,
    rec: &AbortRecord,
    origin: u16,
    end_lsn: Lsn,
    mode: RedoMode,
) -> MeridianResult<()> {
    let latest = rec.latest_xid(xid);
    shared.xids.advance_past(latest);
    if mode == RedoMode::Standby {
        shared.known_assigned.record_assigned(latest);
    }

    shared
        .clog
        .set_tree_status(xid, &rec.subxacts, XidStatus::Aborted, Lsn::INVALID);

    if let Some(o) = rec.origin {
        shared.origins.advance(origin, o.origin_lsn, o.origin_timestamp);
    }
    if mode == RedoMode::Standby {
        shared.known_assigned.expire_tree(xid, &rec.subxacts);
    }
    shared.proc_array.set_latest_completed_xid(latest);

    drop_files(
        shared,
        end_lsn,
        &rec.xnodes,
        &rec.deldbs,
        rec.tablespace_to_delete,
    )
}

/// Remove storage the record says is gone. The log is flushed past the
/// record first so a file is never deleted by an unlogged decision.
fn drop_files(
    shared: &SharedState,
    end_lsn: Lsn,
    rels: &[RelFileNode],
    dbs: &[DbDirSpec],
    tablespace: Oid,
) -> MeridianResult<()> {
    if rels.is_empty() && dbs.is_empty() && tablespace == Oid::INVALID {
        return Ok(());
    }
    if shared.xlog.flushed_lsn().0 < end_lsn.0 {
        shared.xlog.flush(shared.xlog.end_lsn())?;
    }
    for rel in rels {
        if let Err(e) = shared.smgr.unlink_relation(*rel) {
            tracing::warn!("redo: could not remove relation file {}: {}", rel, e);
        }
    }
    for db in dbs {
        if let Err(e) = shared.smgr.drop_database_dir(*db) {
            tracing::warn!(
                "redo: could not remove directory of database {}: {}",
                db.database,
                e
            );
        }
    }
    if tablespace != Oid::INVALID {
        if let Err(e) = shared.smgr.drop_tablespace_dir(tablespace) {
            tracing::warn!("redo: could not remove tablespace {}: {}", tablespace, e);
        }
    }
    Ok(())
}

/// A prepared transaction finished: its two-phase state must exist, or the
/// log and the state files disagree.
fn forget_prepared(shared: &SharedState, xid: Xid) -> MeridianResult<()> {
    match shared.twophase.remove_by_xid(xid) {
        Some(data) => {
            tracing::debug!("redo: prepared transaction {} (xid {}) finished", data.gid, xid);
            Ok(())
        }
        None => Err(TwoPhaseError::ReplayXidNotFound(xid).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use meridian_common::config::MeridianConfig;
    use meridian_common::error::MeridianError;
    use meridian_common::types::{DistribTimestamp, DistribXid, TimestampTz};
    use meridian_storage::xact_record::DistribInfo;
    use meridian_storage::MemLog;

    use super::*;
    use crate::shared::SharedStateBuilder;

    fn standby() -> (Arc<MemLog>, Arc<SharedState>) {
        let log = Arc::new(MemLog::new());
        let shared = SharedStateBuilder::new(MeridianConfig::default())
            .xlog(log.clone())
            .build()
            .unwrap();
        (log, shared)
    }

    fn append(log: &MemLog, xid: Xid, info: u8, data: Bytes) -> Lsn {
        XlogRecord {
            rmid: RM_XACT_ID,
            info,
            origin: 0,
            xid,
            data,
        }
        .insert(log)
        .unwrap()
    }

    #[test]
    fn test_replay_commit_with_children() {
        let (log, shared) = standby();
        let rec = CommitRecord {
            xact_time: TimestampTz(1),
            subxacts: vec![Xid(11), Xid(12)],
            distrib: Some(DistribInfo {
                distrib_timestamp: DistribTimestamp(7),
                distrib_xid: DistribXid(70),
            }),
            ..CommitRecord::default()
        };
        let (info, data) = rec.encode();
        append(&log, Xid(10), info, data);

        let stats = replay(&shared, Lsn::INVALID, RedoMode::Crash).unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(shared.clog.status(Xid(10)), XidStatus::Committed);
        assert_eq!(shared.clog.status(Xid(12)), XidStatus::Committed);
        assert_eq!(
            shared.distributed_log.committed_check(Xid(11)).unwrap().distrib_xid,
            DistribXid(70)
        );
        assert!(Xid(12).precedes(shared.xids.next_xid()));
        assert_eq!(shared.proc_array.latest_completed_xid(), Xid(12));
    }

    #[test]
    fn test_standby_tracks_known_assigned() {
        let (log, shared) = standby();
        // Starting point of the standby's view of the primary.
        shared.known_assigned.record_assigned(Xid(19));
        let (info, data) = AssignmentRecord {
            xtop: Xid(20),
            xsub: vec![Xid(21), Xid(22)],
        }
        .encode();
        append(&log, Xid(20), info, data);
        let stats = replay(&shared, Lsn::INVALID, RedoMode::Standby).unwrap();
        assert_eq!(stats.assignments, 1);
        assert!(shared.known_assigned.contains(Xid(20)));
        assert!(!shared.known_assigned.contains(Xid(21)));
        assert_eq!(shared.subtrans.topmost(Xid(22)), Xid(20));

        let from = stats.end_lsn;
        let (info, data) = AbortRecord {
            subxacts: vec![Xid(21), Xid(22)],
            ..AbortRecord::default()
        }
        .encode();
        append(&log, Xid(20), info, data);
        replay(&shared, from, RedoMode::Standby).unwrap();
        assert!(!shared.known_assigned.contains(Xid(20)));
        assert!(shared.clog.did_abort(Xid(22)));
    }

    #[test]
    fn test_commit_prepared_without_state_is_fatal() {
        let (log, shared) = standby();
        let (info, data) = CommitRecord {
            twophase_xid: Some(Xid(30)),
            ..CommitRecord::default()
        }
        .encode();
        append(&log, Xid(30), info, data);
        let err = replay(&shared, Lsn::INVALID, RedoMode::Crash).unwrap_err();
        assert!(matches!(
            err,
            MeridianError::TwoPhase(TwoPhaseError::ReplayXidNotFound(Xid(30)))
        ));
        assert_eq!(err.severity(), meridian_common::error::Severity::Fatal);
    }

    #[test]
    fn test_unknown_opcode_bits_halt_replay() {
        let (log, shared) = standby();
        append(&log, Xid(40), 0x05, Bytes::new());
        let err = replay(&shared, Lsn::INVALID, RedoMode::Crash).unwrap_err();
        assert!(matches!(
            err,
            MeridianError::Redo(RedoError::UnknownOpcode { info: 0x05, .. })
        ));
    }

    #[test]
    fn test_foreign_resource_manager_halts_replay() {
        let (log, shared) = standby();
        let lsn = XlogRecord {
            rmid: 9,
            info: 0,
            origin: 0,
            xid: Xid::INVALID,
            data: Bytes::new(),
        }
        .insert(log.as_ref())
        .unwrap();
        assert_eq!(lsn.0, XLOG_HEADER_SIZE);
        let err = replay(&shared, Lsn::INVALID, RedoMode::Crash).unwrap_err();
        assert!(matches!(err, MeridianError::Redo(RedoError::UnknownRmgr(9))));
    }
}
