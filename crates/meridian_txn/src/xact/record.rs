//! Writing commit, abort and assignment records, and finishing prepared
//! transactions.
//!
//! Ordering: the log record goes in before the distributed log, the
//! distributed log before the commit log, and the commit log before the
//! process array forgets the xid.

use bytes::Bytes;
use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{Lsn, Oid, TimestampTz, Xid};
use meridian_storage::xact_record::{
    latest_of, AbortRecord, AssignmentRecord, CommitRecord, DbInfo, DistribInfo,
    DistributedForgetRecord, OriginInfo, XactRecordKind, XACT_COMPLETION_FORCE_SYNC_COMMIT,
};
use meridian_storage::xlog::RM_XACT_ID;
use meridian_storage::{XidStatus, XlogRecord};

use super::Backend;
use crate::coordinator::DistributedIdentity;
use crate::lock::LockOwner;

impl Backend {
    fn insert_record(&self, info: u8, xid: Xid, data: Bytes) -> MeridianResult<Lsn> {
        let origin = self.replication_origin.map(|(id, _, _)| id).unwrap_or(0);
        let record = XlogRecord {
            rmid: RM_XACT_ID,
            info,
            origin,
            xid,
            data,
        };
        let lsn = record.insert(self.shared.xlog.as_ref())?;
        metrics::counter!(
            "meridian_xlog_records_total",
            "kind" => XactRecordKind::from_info(info).name()
        )
        .increment(1);
        Ok(lsn)
    }

    fn origin_info(&self) -> Option<OriginInfo> {
        self.replication_origin
            .map(|(_, origin_lsn, origin_timestamp)| OriginInfo {
                origin_lsn,
                origin_timestamp,
            })
    }

    /// Make the top-level transaction durable and visible as committed.
    /// Returns the latest xid of the tree (invalid if none was assigned).
    pub(crate) fn record_transaction_commit(&mut self) -> MeridianResult<Xid> {
        let top = self.stack.top();
        let xid = top.xid;
        let children = top.child_xids.clone();
        let rels = self.pending_rels(true);
        let has_deldbs = !self.pending_deldbs.is_empty();

        if !xid.is_valid() {
            if !rels.is_empty() || has_deldbs {
                return Err(XactError::FilesWithoutXid.into());
            }
            return Ok(Xid::INVALID);
        }

        let distrib = self.distributed.map(|d| DistribInfo {
            distrib_timestamp: d.timestamp,
            distrib_xid: d.xid,
        });
        let invals: Vec<_> = self.pending_invals.iter().map(|(_, m)| *m).collect();
        let identity = self.options.identity;
        let record = CommitRecord {
            xact_time: TimestampTz::now(),
            tablespace_to_delete: self.tablespace_to_delete.unwrap_or(Oid::INVALID),
            flags: if self.force_sync {
                XACT_COMPLETION_FORCE_SYNC_COMMIT
            } else {
                0
            },
            db_info: (!invals.is_empty()).then_some(DbInfo {
                db_id: identity.database,
                ts_id: identity.tablespace,
            }),
            subxacts: children.clone(),
            xnodes: rels,
            invals,
            deldbs: self.pending_deldbs.iter().map(|(_, d)| *d).collect(),
            twophase_xid: None,
            origin: self.origin_info(),
            distrib,
        };
        let (info, data) = record.encode();
        let lsn = self.insert_record(info, xid, data)?;

        let sync = self.shared.config().xact.synchronous_commit
            || self.force_sync
            || !record.xnodes.is_empty()
            || !record.deldbs.is_empty()
            || distrib.is_some();
        // From here on the commit record is in the log and no abort record
        // may follow it.
        let async_lsn = if sync {
            if let Err(e) = self.shared.xlog.flush(lsn) {
                return Err(self.abandon_logged_transaction(xid, "COMMIT", e.into()));
            }
            Lsn::INVALID
        } else {
            lsn
        };

        if let Some(d) = distrib {
            if let Err(e) = self.shared.distributed_log.set_committed_tree(
                xid,
                &children,
                d.distrib_timestamp,
                d.distrib_xid,
                false,
            ) {
                return Err(self.abandon_logged_transaction(xid, "COMMIT", e));
            }
        }
        self.shared
            .clog
            .set_tree_status(xid, &children, XidStatus::Committed, async_lsn);
        if let Some(d) = distrib {
            self.distrib_cache.add(xid, d.distrib_xid);
        }
        if let Some((origin, origin_lsn, ts)) = self.replication_origin {
            self.shared.origins.advance(origin, origin_lsn, ts);
        }
        Ok(latest_of(xid, &children))
    }

    /// Log and advertise the abort of the current (sub)transaction. The
    /// record is not flushed: a lost abort reads the same as a crash.
    pub(crate) fn record_transaction_abort(&mut self, is_subxact: bool) -> MeridianResult<Xid> {
        let frame = self.stack.current();
        let xid = frame.xid;
        if !xid.is_valid() {
            return Ok(Xid::INVALID);
        }
        if self.shared.clog.status(xid) == XidStatus::Committed {
            return Err(XactError::AlreadyCommitted(xid).into());
        }
        let children = frame.child_xids.clone();
        let level = frame.nesting_level;
        let rels = self
            .pending_deletes
            .iter()
            .filter(|d| !d.at_commit && (!is_subxact || d.nesting_level >= level))
            .map(|d| d.rel)
            .collect();

        let record = AbortRecord {
            xact_time: TimestampTz::now(),
            tablespace_to_delete: Oid::INVALID,
            flags: 0,
            subxacts: children.clone(),
            xnodes: rels,
            deldbs: Vec::new(),
            twophase_xid: None,
            origin: self.origin_info(),
        };
        let (info, data) = record.encode();
        if let Err(e) = self.insert_record(info, xid, data) {
            tracing::error!("could not log abort of xid {}: {}", xid, e);
        }
        self.shared
            .clog
            .set_tree_status(xid, &children, XidStatus::Aborted, Lsn::INVALID);
        if is_subxact {
            self.unreported_xids
                .retain(|x| *x != xid && !children.contains(x));
        }
        Ok(latest_of(xid, &children))
    }

    /// Tell standbys which sub-xids belong to the top-level transaction so
    /// their known-assigned set stays bounded.
    pub(crate) fn log_assignment(&mut self) -> MeridianResult<()> {
        let xtop = self.stack.top().xid;
        if self.unreported_xids.is_empty() || !xtop.is_valid() {
            return Ok(());
        }
        let record = AssignmentRecord {
            xtop,
            xsub: std::mem::take(&mut self.unreported_xids),
        };
        let (info, data) = record.encode();
        self.insert_record(info, xtop, data)?;
        tracing::debug!(
            "logged assignment of {} sub-xid(s) to {}",
            record.xsub.len(),
            xtop
        );
        Ok(())
    }

    /// The coordinator has told every participant the outcome; the
    /// distributed transaction can be forgotten.
    pub(crate) fn log_distributed_forget(
        &self,
        identity: DistributedIdentity,
    ) -> MeridianResult<()> {
        let record = DistributedForgetRecord {
            distrib_timestamp: identity.timestamp,
            distrib_xid: identity.xid,
        };
        let (info, data) = record.encode();
        self.insert_record(info, Xid::INVALID, data)?;
        Ok(())
    }

    /// `COMMIT PREPARED` / `ROLLBACK PREPARED`.
    pub fn finish_prepared_transaction(&mut self, gid: &str, commit: bool) -> MeridianResult<()> {
        let stmt = if commit {
            "COMMIT PREPARED"
        } else {
            "ROLLBACK PREPARED"
        };
        self.prevent_transaction_chain(stmt)?;
        self.shared.check_usable()?;

        let claim = self
            .shared
            .twophase
            .lock_for_finish(gid, self.proc.backend_id())?;
        let data = &claim.data;
        let xid = data.xid;

        self.cancel.hold_interrupts();
        let inserted = if commit {
            let record = CommitRecord {
                xact_time: TimestampTz::now(),
                subxacts: data.subxids.clone(),
                xnodes: data.commit_rels.clone(),
                invals: data.invals.clone(),
                db_info: (!data.invals.is_empty()).then_some(DbInfo {
                    db_id: data.database,
                    ts_id: self.options.identity.tablespace,
                }),
                twophase_xid: Some(xid),
                distrib: data.distrib,
                ..CommitRecord::default()
            };
            let (info, body) = record.encode();
            self.insert_record(info, xid, body)
        } else {
            let record = AbortRecord {
                xact_time: TimestampTz::now(),
                tablespace_to_delete: Oid::INVALID,
                flags: 0,
                subxacts: data.subxids.clone(),
                xnodes: data.abort_rels.clone(),
                deldbs: Vec::new(),
                twophase_xid: Some(xid),
                origin: None,
            };
            let (info, body) = record.encode();
            self.insert_record(info, xid, body)
        };
        let lsn = match inserted {
            Ok(lsn) => lsn,
            Err(e) => {
                self.cancel.resume_interrupts();
                self.shared.twophase.unlock(gid);
                return Err(e);
            }
        };
        if let Err(e) = self.shared.xlog.flush(lsn) {
            // The gid stays claimed: a second finish record would fail redo.
            self.cancel.resume_interrupts();
            let record = if commit { "COMMIT PREPARED" } else { "ABORT PREPARED" };
            let err = XactError::OutcomeUnresolved {
                xid,
                record,
                reason: MeridianError::from(e).to_string(),
            };
            return Err(self.shared.stop_for_recovery(err.into()));
        }

        if commit {
            if let Some(d) = data.distrib {
                if let Err(e) = self.shared.distributed_log.set_committed_tree(
                    xid,
                    &data.subxids,
                    d.distrib_timestamp,
                    d.distrib_xid,
                    false,
                ) {
                    tracing::error!("{}", e);
                }
            }
            self.shared
                .clog
                .set_tree_status(xid, &data.subxids, XidStatus::Committed, Lsn::INVALID);
        } else {
            self.shared
                .clog
                .set_tree_status(xid, &data.subxids, XidStatus::Aborted, Lsn::INVALID);
        }

        let latest = latest_of(xid, &data.subxids);
        if let Some(dummy) = claim.dummy_proc {
            self.shared.proc_array.release_dummy(dummy, latest);
        }
        let rels = if commit {
            &data.commit_rels
        } else {
            &data.abort_rels
        };
        self.drop_storage(rels, &[], None);
        if let Some(dummy) = claim.dummy_proc {
            let released = self.shared.locks.release_all(LockOwner(dummy as u32));
            tracing::trace!("released {} lock(s) of prepared {}", released, gid);
        }
        self.shared.twophase.remove(gid);
        self.cancel.resume_interrupts();

        if self.options.dtx_context.is_coordinator() {
            if let Err(e) = self.shared.coordinator.finish_prepared(gid, commit) {
                tracing::error!("could not finish {} on participants: {}", gid, e);
            }
        }
        let action = if commit {
            "commit_prepared"
        } else {
            "abort_prepared"
        };
        metrics::counter!("meridian_xact_total", "action" => action).increment(1);
        tracing::info!("{} {} (xid {})", stmt, gid, xid);
        Ok(())
    }
}
