//! Commit/abort record wire layout.
//!
//! These records are replayed by other nodes during log shipping, so the
//! byte layout is pinned here with literal expected encodings, and every
//! optional block is checked to survive encode → decode together with the
//! others.

use meridian_common::types::*;
use meridian_storage::xact_record::*;

fn rel(n: u32) -> RelFileNode {
    RelFileNode {
        spc_node: Oid(1663),
        db_node: Oid(5),
        rel_node: Oid(n),
    }
}

fn full_commit() -> CommitRecord {
    CommitRecord {
        xact_time: TimestampTz(1_700_000_000_000_000),
        tablespace_to_delete: Oid(16400),
        flags: XACT_COMPLETION_FORCE_SYNC_COMMIT,
        db_info: Some(DbInfo {
            db_id: Oid(5),
            ts_id: Oid(1663),
        }),
        subxacts: vec![Xid(101), Xid(102), Xid(104)],
        xnodes: vec![rel(16384), rel(16385)],
        invals: vec![
            InvalidationMessage {
                id: -2,
                db_id: Oid(5),
                a: 16384,
                b: 0,
            },
            InvalidationMessage {
                id: 3,
                db_id: Oid(5),
                a: 77,
                b: 0xDEAD_BEEF,
            },
        ],
        deldbs: vec![DbDirSpec {
            database: Oid(6),
            tablespace: Oid(1663),
        }],
        twophase_xid: Some(Xid(100)),
        origin: Some(OriginInfo {
            origin_lsn: Lsn(0xABCD_0000_1234),
            origin_timestamp: TimestampTz(99),
        }),
        distrib: Some(DistribInfo {
            distrib_timestamp: DistribTimestamp(1_699_999_000),
            distrib_xid: DistribXid(880_001),
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pinned byte layout
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_commit_layout_dbinfo_and_subxacts() {
    let rec = CommitRecord {
        xact_time: TimestampTz(0x0102_0304_0506_0708),
        db_info: Some(DbInfo {
            db_id: Oid(5),
            ts_id: Oid(1663),
        }),
        subxacts: vec![Xid(101)],
        ..Default::default()
    };
    let (info, body) = rec.encode();
    assert_eq!(info, XLOG_XACT_COMMIT | XLOG_XACT_HAS_INFO);
    let expected: Vec<u8> = vec![
        0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // xact_time
        0x00, 0x00, 0x00, 0x00, // tablespace_to_delete
        0x03, 0x00, 0x00, 0x00, // xinfo = DBINFO | SUBXACTS
        0x05, 0x00, 0x00, 0x00, // db_id
        0x7F, 0x06, 0x00, 0x00, // ts_id = 1663
        0x01, 0x00, 0x00, 0x00, // nsubxacts
        0x65, 0x00, 0x00, 0x00, // 101
    ];
    assert_eq!(body.as_ref(), expected.as_slice());
}

#[test]
fn test_distributed_commit_layout() {
    let rec = CommitRecord {
        xact_time: TimestampTz(0x0102_0304_0506_0708),
        db_info: Some(DbInfo {
            db_id: Oid(5),
            ts_id: Oid(1663),
        }),
        subxacts: vec![Xid(101)],
        distrib: Some(DistribInfo {
            distrib_timestamp: DistribTimestamp(2),
            distrib_xid: DistribXid(0x11_2233_4455),
        }),
        ..Default::default()
    };
    let (info, body) = rec.encode();
    assert_eq!(info, XLOG_XACT_DISTRIBUTED_COMMIT | XLOG_XACT_HAS_INFO);
    assert_eq!(&body[12..16], &[0x03, 0x02, 0x00, 0x00], "xinfo");
    assert_eq!(
        &body[body.len() - 12..],
        &[0x02, 0x00, 0x00, 0x00, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00, 0x00],
        "distrib block is last"
    );
}

#[test]
fn test_invalidation_message_is_sixteen_bytes() {
    let rec = CommitRecord {
        invals: vec![InvalidationMessage {
            id: -1,
            db_id: Oid(9),
            a: 1,
            b: 2,
        }],
        ..Default::default()
    };
    let (_, body) = rec.encode();
    // header 12 + xinfo 4 + count 4 + message 16
    assert_eq!(body.len(), 36);
    assert_eq!(&body[20..24], &[0xFF, 0x00, 0x00, 0x00]);
}

#[test]
fn test_abort_layout() {
    let rec = AbortRecord {
        xact_time: TimestampTz(1),
        subxacts: vec![Xid(7)],
        xnodes: vec![rel(1)],
        ..Default::default()
    };
    let (info, body) = rec.encode();
    assert_eq!(info, XLOG_XACT_ABORT | XLOG_XACT_HAS_INFO);
    // header 12 + xinfo 4 + (4 + 4) subxacts + (4 + 12) rels
    assert_eq!(body.len(), 40);
    assert_eq!(&body[12..16], &[0x06, 0x00, 0x00, 0x00]);
}

#[test]
fn test_assignment_layout() {
    let rec = AssignmentRecord {
        xtop: Xid(100),
        xsub: vec![Xid(101), Xid(102)],
    };
    let (info, body) = rec.encode();
    assert_eq!(info, XLOG_XACT_ASSIGNMENT);
    assert_eq!(
        body.as_ref(),
        &[100, 0, 0, 0, 2, 0, 0, 0, 101, 0, 0, 0, 102, 0, 0, 0]
    );
    assert_eq!(AssignmentRecord::decode(&body).unwrap(), rec);
}

// ═══════════════════════════════════════════════════════════════════════════
// Optional blocks survive encode → decode
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_all_commit_blocks_survive() {
    let rec = full_commit();
    let (info, body) = rec.encode();
    assert_eq!(info & XLOG_XACT_OPMASK, XLOG_XACT_COMMIT_PREPARED);
    let parsed = CommitRecord::decode(info, &body).unwrap();
    assert_eq!(parsed, rec);
    assert_eq!(parsed.flags, XACT_COMPLETION_FORCE_SYNC_COMMIT);
}

#[test]
fn test_dropping_one_block_keeps_the_rest() {
    let base = full_commit();
    let variants: Vec<(&str, CommitRecord)> = vec![
        ("no dbinfo", CommitRecord { db_info: None, ..base.clone() }),
        ("no subxacts", CommitRecord { subxacts: vec![], ..base.clone() }),
        ("no rels", CommitRecord { xnodes: vec![], ..base.clone() }),
        ("no invals", CommitRecord { invals: vec![], ..base.clone() }),
        ("no deldbs", CommitRecord { deldbs: vec![], ..base.clone() }),
        ("no twophase", CommitRecord { twophase_xid: None, ..base.clone() }),
        ("no origin", CommitRecord { origin: None, ..base.clone() }),
        ("no distrib", CommitRecord { distrib: None, ..base.clone() }),
    ];
    for (what, rec) in variants {
        let (info, body) = rec.encode();
        let parsed = CommitRecord::decode(info, &body)
            .unwrap_or_else(|e| panic!("{}: decode failed: {}", what, e));
        assert_eq!(parsed, rec, "{}", what);
    }
}

#[test]
fn test_abort_prepared_with_origin_survives() {
    let rec = AbortRecord {
        xact_time: TimestampTz(5),
        tablespace_to_delete: Oid(0),
        flags: 0,
        subxacts: vec![Xid(12)],
        xnodes: vec![],
        deldbs: vec![DbDirSpec {
            database: Oid(3),
            tablespace: Oid(1663),
        }],
        twophase_xid: Some(Xid(11)),
        origin: Some(OriginInfo {
            origin_lsn: Lsn(1),
            origin_timestamp: TimestampTz(2),
        }),
    };
    let (info, body) = rec.encode();
    assert_eq!(XactRecordKind::from_info(info), XactRecordKind::AbortPrepared);
    assert_eq!(AbortRecord::decode(info, &body).unwrap(), rec);
}

#[test]
fn test_commit_decoder_refuses_abort_opcode() {
    let (info, body) = AbortRecord::default().encode();
    assert!(CommitRecord::decode(info, &body).is_err());
}

#[test]
fn test_distributed_forget_round_trip() {
    let rec = DistributedForgetRecord {
        distrib_timestamp: DistribTimestamp(10),
        distrib_xid: DistribXid(20),
    };
    let (info, body) = rec.encode();
    assert_eq!(info, XLOG_XACT_DISTRIBUTED_FORGET);
    assert_eq!(DistributedForgetRecord::decode(&body).unwrap(), rec);
}
