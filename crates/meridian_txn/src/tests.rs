#[cfg(test)]
mod xact_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use meridian_common::config::MeridianConfig;
    use meridian_common::error::{MeridianError, MeridianResult, Severity, WalError, XactError};
    use meridian_common::types::{CommandId, Lsn, Oid, RelFileNode, SessionId, Xid};
    use meridian_storage::xact_record::{
        AbortRecord, CommitRecord, XactRecordKind, XLOG_XACT_OPMASK,
    };
    use meridian_storage::xlog::read_records;
    use meridian_storage::{DurableLog, FsStorageManager, MemLog, XidStatus};

    use crate::coordinator::DtxContext;
    use crate::shared::{SharedState, SharedStateBuilder};
    use crate::snapshot::Snapshot;
    use crate::xact::{Backend, BackendOptions, TBlockState, TransState, TransactionHandle};

    fn setup() -> Arc<SharedState> {
        SharedState::in_memory(MeridianConfig::default()).unwrap()
    }

    fn connect(shared: &Arc<SharedState>) -> Backend {
        Backend::connect(shared, BackendOptions::default()).unwrap()
    }

    fn connect_as(shared: &Arc<SharedState>, ctx: DtxContext, session: i32) -> Backend {
        let options = BackendOptions {
            dtx_context: ctx,
            session: Some(SessionId(session)),
            ..BackendOptions::default()
        };
        Backend::connect(shared, options).unwrap()
    }

    fn assert_idle(b: &Backend) {
        assert_eq!(b.block_state(), TBlockState::Default);
        assert_eq!(b.trans_state(), TransState::Default);
        assert!(b.get_top_transaction_id_if_any().is_none());
    }

    /// Every transaction record in the log, with its kind.
    fn xact_records(shared: &SharedState) -> Vec<(XactRecordKind, Xid, u8, bytes::Bytes)> {
        read_records(shared.xlog.as_ref(), Lsn::INVALID)
            .unwrap()
            .into_iter()
            .map(|(_, r)| (XactRecordKind::from_info(r.info), r.xid, r.info, r.data))
            .collect()
    }

    fn record_kinds(shared: &SharedState) -> Vec<XactRecordKind> {
        xact_records(shared).into_iter().map(|r| r.0).collect()
    }

    /// In-memory log whose flushes can be made to fail.
    #[derive(Default)]
    struct FlakyLog {
        inner: MemLog,
        fail_flush: AtomicBool,
    }

    impl DurableLog for FlakyLog {
        fn append(&self, payload: &[u8]) -> Result<Lsn, WalError> {
            self.inner.append(payload)
        }

        fn flush(&self, upto: Lsn) -> Result<(), WalError> {
            if self.fail_flush.load(Ordering::Acquire) {
                return Err(WalError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "device gone",
                )));
            }
            self.inner.flush(upto)
        }

        fn flushed_lsn(&self) -> Lsn {
            self.inner.flushed_lsn()
        }

        fn end_lsn(&self) -> Lsn {
            self.inner.end_lsn()
        }

        fn read_at(&self, lsn: Lsn) -> Result<Option<(Vec<u8>, Lsn)>, WalError> {
            self.inner.read_at(lsn)
        }
    }

    // ── Transaction ids ──

    #[test]
    fn test_subtransaction_xids_follow_their_parents() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        let mut xids = vec![b.execute(h, |b| b.get_top_transaction_id()).unwrap()];
        for name in ["a", "b", "c", "d"] {
            b.save_point_begin(h, name).unwrap();
            xids.push(b.execute(h, |b| b.get_current_transaction_id()).unwrap());
        }
        for pair in xids.windows(2) {
            assert!(pair[0].precedes(pair[1]), "{} !< {}", pair[0], pair[1]);
        }
        for &xid in &xids {
            assert!(b.is_current_transaction_id(h, xid));
            assert_eq!(shared.subtrans.topmost(xid), xids[0]);
        }
        assert!(b.commit(h).unwrap());
        for &xid in &xids {
            assert!(shared.xid_did_commit(xid));
        }
    }

    #[test]
    fn test_lazy_xid_assignment_writes_no_record() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        b.execute(h, |b| {
            b.command_counter_increment()?;
            Ok(())
        })
        .unwrap();
        assert!(b.current_transaction_id(h).is_none());
        assert!(b.commit(h).unwrap());
        assert!(xact_records(&shared).is_empty());
    }

    #[test]
    fn test_savepoint_release_reports_child_in_commit_record() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        let top = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
        b.save_point_begin(h, "a").unwrap();
        let sub = b.execute(h, |b| b.get_current_transaction_id()).unwrap();
        b.save_point_release(h, "a").unwrap();
        assert_eq!(b.committed_children(), &[sub]);

        assert!(b.commit(h).unwrap());
        assert!(b.get_top_transaction_id_if_any().is_none());

        let records = xact_records(&shared);
        let (kind, xid, info, data) = records.last().unwrap();
        assert_eq!(*kind, XactRecordKind::Commit);
        assert_eq!(*xid, top);
        let rec = CommitRecord::decode(*info, data).unwrap();
        assert_eq!(rec.subxacts, vec![sub]);
        assert_eq!(shared.clog.status(sub), XidStatus::Committed);
    }

    #[test]
    fn test_rolled_back_savepoint_is_aborted_and_not_reported() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        let top = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
        b.save_point_begin(h, "a").unwrap();
        let sub = b.execute(h, |b| b.get_current_transaction_id()).unwrap();
        b.save_point_rollback(h, "a").unwrap();
        b.save_point_release(h, "a").unwrap();
        assert!(b.committed_children().is_empty());
        assert!(b.commit(h).unwrap());

        assert!(shared.clog.did_abort(sub));
        assert!(shared.xid_did_commit(top));
        let records = xact_records(&shared);
        assert_eq!(records[0].0, XactRecordKind::Abort);
        assert_eq!(records[0].1, sub);
        let (_, _, info, data) = records.last().unwrap();
        assert!(CommitRecord::decode(*info, data).unwrap().subxacts.is_empty());
    }

    #[test]
    fn test_rollback_records_whole_tree() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        let top = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
        b.save_point_begin(h, "a").unwrap();
        let sub = b.execute(h, |b| b.get_current_transaction_id()).unwrap();
        b.save_point_release(h, "a").unwrap();
        b.abort(h);
        assert_idle(&b);

        assert!(shared.clog.did_abort(top));
        assert!(shared.clog.did_abort(sub));
        let (kind, _, info, data) = xact_records(&shared).pop().unwrap();
        assert_eq!(kind, XactRecordKind::Abort);
        assert_eq!(AbortRecord::decode(info, &data).unwrap().subxacts, vec![sub]);
    }

    // ── Visibility to other backends ──

    #[test]
    fn test_observer_sees_single_visibility_flip() {
        let shared = setup();
        let mut owner = connect(&shared);
        let mut observer = connect(&shared);

        let h = owner.begin().unwrap();
        let xid = owner.execute(h, |b| b.get_top_transaction_id()).unwrap();
        let oh = observer.begin().unwrap();

        assert!(!observer.is_current_transaction_id(oh, xid));
        assert!(shared.xid_in_progress(xid));
        let snap = shared.proc_array.snapshot(Some(observer.proc_index()), CommandId::FIRST);
        assert!(snap.xid_in_progress(xid));

        assert!(owner.commit(h).unwrap());

        assert!(!observer.is_current_transaction_id(oh, xid));
        assert!(!shared.xid_in_progress(xid));
        assert!(shared.xid_did_commit(xid));
        let snap = shared.proc_array.snapshot(Some(observer.proc_index()), CommandId::FIRST);
        assert!(!snap.xid_in_progress(xid));
        observer.abort(oh);
    }

    #[test]
    fn test_wait_for_transaction_returns_after_commit() {
        let shared = setup();
        let mut owner = connect(&shared);
        let h = owner.begin().unwrap();
        let xid = owner.execute(h, |b| b.get_top_transaction_id()).unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let mut b = connect(&shared);
                b.wait_for_transaction(xid)
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(owner.commit(h).unwrap());
            waiter.join().unwrap().unwrap();
        });
        assert!(shared.xid_did_commit(xid));
    }

    // ── Savepoints ──

    #[test]
    fn test_savepoint_rollback_keeps_name_and_level() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        b.save_point_begin(h, "outer").unwrap();
        b.save_point_begin(h, "sp").unwrap();
        let level = b.transaction_stack().current().savepoint_level;
        let nesting = b.transaction_stack().current().nesting_level;

        b.save_point_rollback(h, "sp").unwrap();
        let frame = b.transaction_stack().current();
        assert_eq!(frame.name.as_deref(), Some("sp"));
        assert_eq!(frame.savepoint_level, level);

        b.save_point_begin(h, "sp").unwrap();
        let frame = b.transaction_stack().current();
        assert_eq!(frame.name.as_deref(), Some("sp"));
        assert_eq!(frame.savepoint_level, level);
        assert_eq!(frame.nesting_level, nesting + 1);

        // The older "sp" is shadowed but still reachable.
        b.save_point_rollback(h, "outer").unwrap();
        assert_eq!(b.transaction_stack().current().name.as_deref(), Some("outer"));
        assert!(b.commit(h).unwrap());
    }

    fn fail(_: &mut Backend) -> MeridianResult<()> {
        Err(XactError::TooManyCommands.into())
    }

    /// Run `partial` inside a fresh block, then roll back.
    fn abort_after(shared: &Arc<SharedState>, name: &str, partial: impl Fn(&mut Backend, TransactionHandle)) {
        let mut b = connect(shared);
        let h = b.begin().unwrap();
        partial(&mut b, h);
        b.abort(h);
        assert_eq!(b.block_state(), TBlockState::Default, "{}", name);
        assert_eq!(b.trans_state(), TransState::Default, "{}", name);
        assert!(b.get_top_transaction_id_if_any().is_none(), "{}", name);
        drop(b);
        assert!(
            shared.proc_array.snapshot(None, CommandId::FIRST).xip.is_empty(),
            "{}",
            name
        );
    }

    #[test]
    fn test_abort_is_safe_from_any_point() {
        let shared = setup();
        abort_after(&shared, "fresh block", |_, _| {});
        abort_after(&shared, "xid assigned", |b, h| {
            b.execute(h, |b| b.get_top_transaction_id()).unwrap();
        });
        abort_after(&shared, "open savepoints", |b, h| {
            b.save_point_begin(h, "a").unwrap();
            b.save_point_begin(h, "b").unwrap();
            b.execute(h, |b| b.get_current_transaction_id()).unwrap();
        });
        abort_after(&shared, "failed statement", |b, h| {
            b.execute(h, |b| b.get_top_transaction_id()).unwrap();
            assert!(b.execute(h, fail).is_err());
        });
        abort_after(&shared, "failed subtransaction", |b, h| {
            b.save_point_begin(h, "a").unwrap();
            b.execute(h, |b| b.get_current_transaction_id()).unwrap();
            assert!(b.execute(h, fail).is_err());
        });
        abort_after(&shared, "unknown savepoint", |b, h| {
            assert!(b.save_point_rollback(h, "nope").is_err());
        });
        abort_after(&shared, "failed prepare", |b, h| {
            b.execute(h, |b| {
                b.get_top_transaction_id()?;
                b.mark_temp_relation_access();
                Ok(())
            })
            .unwrap();
            assert!(b.prepare(h, "gid-temp").is_err());
        });
    }

    // ── Relation files ──

    #[test]
    fn test_dropped_relation_removed_at_commit_created_removed_at_abort() {
        let dir = tempfile::tempdir().unwrap();
        let smgr = Arc::new(FsStorageManager::new(dir.path()));
        let shared = SharedStateBuilder::new(MeridianConfig::default())
            .storage_manager(smgr.clone())
            .build()
            .unwrap();
        let rel = |n| RelFileNode {
            spc_node: Oid(1663),
            db_node: Oid(5),
            rel_node: Oid(n),
        };
        let dropped = smgr.create_relation(rel(100)).unwrap();
        let mut b = connect(&shared);

        let h = b.begin().unwrap();
        b.execute(h, |b| {
            b.get_top_transaction_id()?;
            b.schedule_relation_drop(rel(100));
            Ok(())
        })
        .unwrap();
        assert!(dropped.exists());
        assert!(b.commit(h).unwrap());
        assert!(!dropped.exists());

        let h = b.begin().unwrap();
        let created = b
            .execute(h, |b| {
                b.get_top_transaction_id()?;
                b.register_created_relation(rel(200));
                Ok(smgr.create_relation(rel(200))?)
            })
            .unwrap();
        assert!(created.exists());
        b.abort(h);
        assert!(!created.exists());
    }

    #[test]
    fn test_relation_drop_without_xid_is_rejected() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        b.execute(h, |b| {
            b.schedule_relation_drop(RelFileNode {
                spc_node: Oid(1663),
                db_node: Oid(5),
                rel_node: Oid(1),
            });
            Ok(())
        })
        .unwrap();
        let err = b.commit(h).unwrap_err();
        assert!(matches!(err, MeridianError::Xact(XactError::FilesWithoutXid)));
        assert_idle(&b);
    }

    // ── Distributed transactions ──

    #[test]
    fn test_coordinator_commit_logs_distributed_commit_and_forget() {
        let shared = setup();
        let options = BackendOptions {
            dtx_context: DtxContext::QdDistributedCapable,
            ..BackendOptions::default()
        };
        let mut qd = Backend::connect(&shared, options).unwrap();
        let h = qd.begin().unwrap();
        let xid = qd
            .execute(h, |b| {
                b.executor_mark_transaction_does_writes();
                b.get_top_transaction_id()
            })
            .unwrap();
        let identity = qd.distributed_identity().unwrap();
        assert!(qd.commit(h).unwrap());

        let entry = shared.distributed_log.committed_check(xid).unwrap();
        assert_eq!(entry.distrib_xid, identity.xid);
        assert_eq!(qd.distributed_xid_of(xid), Some(identity.xid));

        let kinds: Vec<_> = xact_records(&shared).into_iter().map(|r| r.0).collect();
        assert_eq!(
            kinds,
            vec![
                XactRecordKind::DistributedCommit,
                XactRecordKind::DistributedForget
            ]
        );
    }

    #[test]
    fn test_prepared_transaction_finished_by_another_backend() {
        let shared = setup();
        let mut observer = connect(&shared);
        let oh = observer.begin().unwrap();

        let mut first = connect(&shared);
        let h = first.begin().unwrap();
        let xid = first.execute(h, |b| b.get_top_transaction_id()).unwrap();
        assert!(first.prepare(h, "gid-1").unwrap());
        assert_idle(&first);
        drop(first);

        assert!(!observer.is_current_transaction_id(oh, xid));
        assert!(shared.xid_in_progress(xid));
        assert_eq!(shared.twophase.list().len(), 1);

        let mut second = connect(&shared);
        second.finish_prepared_transaction("gid-1", true).unwrap();

        assert!(!observer.is_current_transaction_id(oh, xid));
        assert!(!shared.xid_in_progress(xid));
        assert!(shared.xid_did_commit(xid));
        assert!(shared.twophase.list().is_empty());
        let kinds: Vec<_> = xact_records(&shared).into_iter().map(|r| r.0).collect();
        assert_eq!(
            kinds,
            vec![XactRecordKind::Prepare, XactRecordKind::CommitPrepared]
        );
        observer.abort(oh);
    }

    #[test]
    fn test_finish_prepared_inside_block_is_rejected() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        b.execute(h, |b| b.get_top_transaction_id()).unwrap();
        assert!(b.prepare(h, "gid-2").unwrap());

        let h = b.begin().unwrap();
        assert!(b.finish_prepared_transaction("gid-2", false).is_err());
        b.abort(h);
        b.finish_prepared_transaction("gid-2", false).unwrap();
        assert!(shared.twophase.list().is_empty());
    }

    #[test]
    fn test_prepare_with_exported_snapshot_fails() {
        let shared = setup();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        b.execute(h, |b| {
            b.get_top_transaction_id()?;
            b.mark_exported_snapshot();
            Ok(())
        })
        .unwrap();
        let err = b.prepare(h, "gid-3").unwrap_err();
        assert!(matches!(
            err,
            MeridianError::Xact(XactError::PrepareExportedSnapshots)
        ));
        b.abort(h);
        assert_idle(&b);
        assert!(shared.twophase.list().is_empty());
    }

    // ── Shared snapshots ──

    #[test]
    fn test_reader_waits_for_first_publication() {
        let shared = setup();
        let mut writer = connect_as(&shared, DtxContext::QeTwoPhaseExplicitWriter, 42);
        let expected = Snapshot {
            xmin: Xid(90),
            xmax: Xid(105),
            xip: vec![Xid(95), Xid(100)],
            ..Snapshot::default()
        };

        std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let r = connect_as(&shared, DtxContext::QeReader, 42);
                r.lookup_snapshot()
            });
            std::thread::sleep(Duration::from_millis(50));
            let h = writer.begin().unwrap();
            writer.publish_snapshot(expected.clone()).unwrap();
            assert_eq!(reader.join().unwrap().unwrap(), expected);
            writer.abort(h);
        });
    }

    #[test]
    fn test_readers_see_identical_published_state() {
        let shared = setup();
        let mut writer = connect_as(&shared, DtxContext::QeTwoPhaseExplicitWriter, 7);
        let h = writer.begin().unwrap();
        writer.execute(h, |b| b.get_top_transaction_id()).unwrap();
        writer.save_point_begin(h, "a").unwrap();
        writer.execute(h, |b| b.get_current_transaction_id()).unwrap();
        let snapshot = shared
            .proc_array
            .snapshot(Some(writer.proc_index()), CommandId::FIRST);
        let sync = writer.publish_snapshot(snapshot).unwrap();

        let r1 = connect_as(&shared, DtxContext::QeReader, 7);
        let r2 = connect_as(&shared, DtxContext::QeReader, 7);
        let first = r1.lookup_snapshot_synced(sync).unwrap();
        for _ in 0..3 {
            assert_eq!(r1.lookup_published_snapshot().unwrap(), first);
            assert_eq!(r2.lookup_snapshot_synced(sync).unwrap(), first);
        }
        assert_eq!(first.subxids.len(), 1);
        assert!(r1.transaction_id_is_current(first.xid));
        assert!(r1.transaction_id_is_current(first.subxids[0]));
        writer.abort(h);
    }

    #[test]
    fn test_cursor_snapshot_outlives_statement() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeridianConfig::default();
        config.shared_snapshot.scratch_dir = dir.path().display().to_string();
        let shared = SharedState::in_memory(config).unwrap();
        let mut writer = connect_as(&shared, DtxContext::QeTwoPhaseExplicitWriter, 9);
        let h = writer.begin().unwrap();
        writer.execute(h, |b| b.get_top_transaction_id()).unwrap();
        let published = writer.take_and_publish_snapshot().unwrap();
        let key = writer.declare_cursor_snapshot().unwrap();

        let reader = connect_as(&shared, DtxContext::QeReader, 9);
        let read = reader.read_cursor_snapshot(&key).unwrap();
        assert_eq!(read.snapshot, published);
        assert!(dir.path().join(key.file_name()).exists());

        writer.abort(h);
        drop(reader);
        drop(writer);
        assert!(!dir.path().join(key.file_name()).exists());
    }

    #[test]
    fn test_published_subxids_skip_rolled_back_frames() {
        let shared = setup();
        let mut writer = connect_as(&shared, DtxContext::QeTwoPhaseExplicitWriter, 11);
        let h = writer.begin().unwrap();
        writer.execute(h, |b| b.get_top_transaction_id()).unwrap();
        writer.save_point_begin(h, "kept").unwrap();
        let kept = writer.execute(h, |b| b.get_current_transaction_id()).unwrap();
        writer.save_point_release(h, "kept").unwrap();
        writer.save_point_begin(h, "failed").unwrap();
        let failed = writer.execute(h, |b| b.get_current_transaction_id()).unwrap();
        assert!(writer.execute(h, fail).is_err());
        assert_eq!(writer.block_state(), TBlockState::SubAbort);
        writer.take_and_publish_snapshot().unwrap();

        let reader = connect_as(&shared, DtxContext::QeReader, 11);
        let published = reader.lookup_published_snapshot().unwrap();
        assert_eq!(published.subxids, vec![kept]);
        assert!(!reader.transaction_id_is_current(failed));
        drop(reader);
        writer.abort(h);
    }

    // ── Recovery ──

    #[test]
    fn test_crash_recovery_restores_commit_log() {
        let log = Arc::new(MemLog::new());
        let build = || {
            SharedStateBuilder::new(MeridianConfig::default())
                .xlog(log.clone())
                .build()
                .unwrap()
        };
        let (committed, sub, aborted) = {
            let shared = build();
            let mut b = connect(&shared);
            let h = b.begin().unwrap();
            let committed = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
            b.save_point_begin(h, "a").unwrap();
            let sub = b.execute(h, |b| b.get_current_transaction_id()).unwrap();
            b.save_point_release(h, "a").unwrap();
            assert!(b.commit(h).unwrap());

            let h = b.begin().unwrap();
            let aborted = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
            b.abort(h);
            shared.shutdown().unwrap();
            (committed, sub, aborted)
        };

        let shared = build();
        let stats = shared.startup_recovery().unwrap();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts, 1);
        assert!(shared.xid_did_commit(committed));
        assert!(shared.xid_did_commit(sub));
        assert!(shared.clog.did_abort(aborted));
        assert!(aborted.precedes(shared.xids.next_xid()));
    }

    #[test]
    fn test_prepared_transaction_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeridianConfig::default();
        config.wal.data_dir = dir.path().join("data").display().to_string();
        config.shared_snapshot.scratch_dir = dir.path().display().to_string();

        let xid = {
            let shared = SharedState::open(config.clone()).unwrap();
            let mut b = connect(&shared);
            let h = b.begin().unwrap();
            let xid = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
            assert!(b.prepare(h, "gid-restart").unwrap());
            drop(b);
            shared.shutdown().unwrap();
            xid
        };

        let shared = SharedState::open(config).unwrap();
        let prepared = shared.twophase.list();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].gid, "gid-restart");
        assert!(shared.xid_in_progress(xid));
        assert!(xid.precedes(shared.xids.next_xid()));

        let mut b = connect(&shared);
        b.finish_prepared_transaction("gid-restart", true).unwrap();
        assert!(shared.xid_did_commit(xid));
        assert!(!shared.xid_in_progress(xid));
        let opcode = XactRecordKind::CommitPrepared.opcode();
        assert!(xact_records(&shared)
            .iter()
            .any(|r| r.2 & XLOG_XACT_OPMASK == opcode));
    }

    // ── Failures after the outcome is logged ──

    #[test]
    fn test_commit_flush_failure_stops_node_without_abort_record() {
        let log = Arc::new(FlakyLog::default());
        let shared = SharedStateBuilder::new(MeridianConfig::default())
            .xlog(log.clone())
            .build()
            .unwrap();
        let mut b = connect(&shared);
        let h = b.begin().unwrap();
        let xid = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
        log.fail_flush.store(true, Ordering::Release);

        let err = b.commit(h).unwrap_err();
        assert_eq!(err.severity(), Severity::Panic);
        assert!(shared.needs_restart());
        assert_idle(&b);
        assert_eq!(record_kinds(&shared), vec![XactRecordKind::Commit]);
        assert!(!shared.clog.did_abort(xid));
        assert!(shared.xid_in_progress(xid));
        assert!(matches!(
            b.begin().unwrap_err(),
            MeridianError::Xact(XactError::NodeNeedsRestart)
        ));
        drop(b);

        // Recovery settles the outcome from the log.
        log.fail_flush.store(false, Ordering::Release);
        let restarted = SharedStateBuilder::new(MeridianConfig::default())
            .xlog(log.clone())
            .build()
            .unwrap();
        restarted.startup_recovery().unwrap();
        assert!(restarted.xid_did_commit(xid));
    }

    #[test]
    fn test_prepare_failing_after_its_record_stops_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeridianConfig::default();
        config.wal.data_dir = dir.path().join("data").display().to_string();
        config.shared_snapshot.scratch_dir = dir.path().display().to_string();

        let xid = {
            let shared = SharedState::open(config.clone()).unwrap();
            let mut b = connect(&shared);
            let h = b.begin().unwrap();
            let xid = b.execute(h, |b| b.get_top_transaction_id()).unwrap();
            // The state file cannot be written once its directory is gone.
            std::fs::remove_dir_all(config.data_dir().join("twophase")).unwrap();

            let err = b.prepare(h, "gid-lost-state").unwrap_err();
            assert_eq!(err.severity(), Severity::Panic);
            assert!(shared.needs_restart());
            b.abort(h);
            assert_idle(&b);
            assert_eq!(record_kinds(&shared), vec![XactRecordKind::Prepare]);
            assert!(!shared.clog.did_abort(xid));
            assert!(shared.xid_in_progress(xid));
            xid
        };

        // The logged PREPARE stands after restart and can be finished.
        let shared = SharedState::open(config).unwrap();
        let prepared = shared.twophase.list();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].xid, xid);
        let mut b = connect(&shared);
        b.finish_prepared_transaction("gid-lost-state", false).unwrap();
        assert!(shared.clog.did_abort(xid));
        assert!(shared.twophase.list().is_empty());
        assert!(!shared.xid_in_progress(xid));
    }
}
