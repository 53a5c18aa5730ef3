//! Transaction log record formats.
//!
//! Commit and abort records share one layout, all little-endian, no padding:
//!
//! ```text
//! xact_time                i64
//! tablespace_to_delete     u32      (0 = none)
//! xinfo                    u32      only when info & XLOG_XACT_HAS_INFO
//! [DBINFO]        db_id u32, ts_id u32
//! [SUBXACTS]      n i32, xid u32 * n
//! [RELFILENODES]  n i32, (spc u32, db u32, rel u32) * n
//! [INVALS]        n i32, 16-byte message * n            commit only
//! [DELDBS]        n i32, (database u32, tablespace u32) * n
//! [TWOPHASE]      xid u32
//! [ORIGIN]        origin_lsn u64, origin_timestamp i64
//! [DISTRIB]       distrib_timestamp u32, distrib_xid u64 commit only
//! ```
//!
//! Each bracketed block is present iff its `XACT_XINFO_HAS_*` bit is set and
//! always appears in the order above.

use bytes::{BufMut, Bytes, BytesMut};
use meridian_common::error::WalError;
use meridian_common::types::{
    DbDirSpec, DistribTimestamp, DistribXid, Lsn, Oid, RelFileNode, TimestampTz, Xid,
};
use serde::{Deserialize, Serialize};

// ── Opcodes (info byte) ──

pub const XLOG_XACT_COMMIT: u8 = 0x00;
pub const XLOG_XACT_PREPARE: u8 = 0x10;
pub const XLOG_XACT_ABORT: u8 = 0x20;
pub const XLOG_XACT_COMMIT_PREPARED: u8 = 0x30;
pub const XLOG_XACT_ABORT_PREPARED: u8 = 0x40;
pub const XLOG_XACT_ASSIGNMENT: u8 = 0x50;
pub const XLOG_XACT_DISTRIBUTED_COMMIT: u8 = 0x60;
pub const XLOG_XACT_DISTRIBUTED_FORGET: u8 = 0x70;
pub const XLOG_XACT_OPMASK: u8 = 0x70;
/// An `xinfo` word follows the fixed header.
pub const XLOG_XACT_HAS_INFO: u8 = 0x80;

// ── xinfo bits ──

pub const XACT_XINFO_HAS_DBINFO: u32 = 1 << 0;
pub const XACT_XINFO_HAS_SUBXACTS: u32 = 1 << 1;
pub const XACT_XINFO_HAS_RELFILENODES: u32 = 1 << 2;
pub const XACT_XINFO_HAS_INVALS: u32 = 1 << 3;
pub const XACT_XINFO_HAS_TWOPHASE: u32 = 1 << 4;
pub const XACT_XINFO_HAS_ORIGIN: u32 = 1 << 5;
pub const XACT_XINFO_HAS_AE_LOCKS: u32 = 1 << 6;
pub const XACT_XINFO_HAS_DELDBS: u32 = 1 << 8;
pub const XACT_XINFO_HAS_DISTRIB: u32 = 1 << 9;
pub const XACT_COMPLETION_RELCACHE_INIT_FILE: u32 = 1 << 30;
pub const XACT_COMPLETION_FORCE_SYNC_COMMIT: u32 = 1 << 31;

/// Bits that only carry a flag and contribute no block.
pub const XACT_XINFO_FLAG_MASK: u32 =
    XACT_XINFO_HAS_AE_LOCKS | XACT_COMPLETION_RELCACHE_INIT_FILE | XACT_COMPLETION_FORCE_SYNC_COMMIT;

/// Every bit a reader understands; anything else marks a record this
/// version cannot interpret.
pub const XACT_XINFO_KNOWN_MASK: u32 = XACT_XINFO_HAS_DBINFO
    | XACT_XINFO_HAS_SUBXACTS
    | XACT_XINFO_HAS_RELFILENODES
    | XACT_XINFO_HAS_INVALS
    | XACT_XINFO_HAS_TWOPHASE
    | XACT_XINFO_HAS_ORIGIN
    | XACT_XINFO_HAS_DELDBS
    | XACT_XINFO_HAS_DISTRIB
    | XACT_XINFO_FLAG_MASK;

pub const INVAL_MESSAGE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XactRecordKind {
    Commit,
    Prepare,
    Abort,
    CommitPrepared,
    AbortPrepared,
    Assignment,
    DistributedCommit,
    DistributedForget,
}

impl XactRecordKind {
    /// Every opcode value is assigned, so this only fails on a record from
    /// a different resource manager.
    pub fn from_info(info: u8) -> Self {
        match info & XLOG_XACT_OPMASK {
            XLOG_XACT_COMMIT => XactRecordKind::Commit,
            XLOG_XACT_PREPARE => XactRecordKind::Prepare,
            XLOG_XACT_ABORT => XactRecordKind::Abort,
            XLOG_XACT_COMMIT_PREPARED => XactRecordKind::CommitPrepared,
            XLOG_XACT_ABORT_PREPARED => XactRecordKind::AbortPrepared,
            XLOG_XACT_ASSIGNMENT => XactRecordKind::Assignment,
            XLOG_XACT_DISTRIBUTED_COMMIT => XactRecordKind::DistributedCommit,
            _ => XactRecordKind::DistributedForget,
        }
    }

    pub fn opcode(self) -> u8 {
        match self {
            XactRecordKind::Commit => XLOG_XACT_COMMIT,
            XactRecordKind::Prepare => XLOG_XACT_PREPARE,
            XactRecordKind::Abort => XLOG_XACT_ABORT,
            XactRecordKind::CommitPrepared => XLOG_XACT_COMMIT_PREPARED,
            XactRecordKind::AbortPrepared => XLOG_XACT_ABORT_PREPARED,
            XactRecordKind::Assignment => XLOG_XACT_ASSIGNMENT,
            XactRecordKind::DistributedCommit => XLOG_XACT_DISTRIBUTED_COMMIT,
            XactRecordKind::DistributedForget => XLOG_XACT_DISTRIBUTED_FORGET,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            XactRecordKind::Commit => "COMMIT",
            XactRecordKind::Prepare => "PREPARE",
            XactRecordKind::Abort => "ABORT",
            XactRecordKind::CommitPrepared => "COMMIT_PREPARED",
            XactRecordKind::AbortPrepared => "ABORT_PREPARED",
            XactRecordKind::Assignment => "ASSIGNMENT",
            XactRecordKind::DistributedCommit => "DISTRIBUTED_COMMIT",
            XactRecordKind::DistributedForget => "DISTRIBUTED_FORGET",
        }
    }

    pub fn is_commit(self) -> bool {
        matches!(
            self,
            XactRecordKind::Commit
                | XactRecordKind::CommitPrepared
                | XactRecordKind::DistributedCommit
        )
    }

    pub fn is_abort(self) -> bool {
        matches!(self, XactRecordKind::Abort | XactRecordKind::AbortPrepared)
    }
}

/// One shared-cache invalidation message, opaque to the transaction core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub id: i8,
    pub db_id: Oid,
    pub a: u32,
    pub b: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbInfo {
    pub db_id: Oid,
    pub ts_id: Oid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginInfo {
    pub origin_lsn: Lsn,
    pub origin_timestamp: TimestampTz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistribInfo {
    pub distrib_timestamp: DistribTimestamp,
    pub distrib_xid: DistribXid,
}

/// Body of a commit, commit-prepared or distributed-commit record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitRecord {
    pub xact_time: TimestampTz,
    pub tablespace_to_delete: Oid,
    /// Flag-only xinfo bits (see [`XACT_XINFO_FLAG_MASK`]).
    pub flags: u32,
    pub db_info: Option<DbInfo>,
    pub subxacts: Vec<Xid>,
    pub xnodes: Vec<RelFileNode>,
    pub invals: Vec<InvalidationMessage>,
    pub deldbs: Vec<DbDirSpec>,
    pub twophase_xid: Option<Xid>,
    pub origin: Option<OriginInfo>,
    pub distrib: Option<DistribInfo>,
}

/// Body of an abort or abort-prepared record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortRecord {
    pub xact_time: TimestampTz,
    pub tablespace_to_delete: Oid,
    pub flags: u32,
    pub subxacts: Vec<Xid>,
    pub xnodes: Vec<RelFileNode>,
    pub deldbs: Vec<DbDirSpec>,
    pub twophase_xid: Option<Xid>,
    pub origin: Option<OriginInfo>,
}

/// Batch of sub-transaction ids assigned under `xtop` and not yet reported
/// to standbys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub xtop: Xid,
    pub xsub: Vec<Xid>,
}

/// Coordinator note that every participant finished a distributed commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedForgetRecord {
    pub distrib_timestamp: DistribTimestamp,
    pub distrib_xid: DistribXid,
}

// ── Encoding helpers ──

fn put_xids(buf: &mut BytesMut, xids: &[Xid]) {
    buf.put_i32_le(xids.len() as i32);
    for x in xids {
        buf.put_u32_le(x.0);
    }
}

fn put_rels(buf: &mut BytesMut, rels: &[RelFileNode]) {
    buf.put_i32_le(rels.len() as i32);
    for r in rels {
        buf.put_u32_le(r.spc_node.0);
        buf.put_u32_le(r.db_node.0);
        buf.put_u32_le(r.rel_node.0);
    }
}

fn put_deldbs(buf: &mut BytesMut, dbs: &[DbDirSpec]) {
    buf.put_i32_le(dbs.len() as i32);
    for d in dbs {
        buf.put_u32_le(d.database.0);
        buf.put_u32_le(d.tablespace.0);
    }
}

fn put_invals(buf: &mut BytesMut, msgs: &[InvalidationMessage]) {
    buf.put_i32_le(msgs.len() as i32);
    for m in msgs {
        buf.put_i8(m.id);
        buf.put_bytes(0, 3);
        buf.put_u32_le(m.db_id.0);
        buf.put_u32_le(m.a);
        buf.put_u32_le(m.b);
    }
}

fn put_header(buf: &mut BytesMut, xact_time: TimestampTz, tablespace: Oid) {
    buf.put_i64_le(xact_time.0);
    buf.put_u32_le(tablespace.0);
}

// ── Decoding helpers ──

fn ensure(buf: &[u8], need: usize) -> Result<(), WalError> {
    if buf.len() < need {
        return Err(WalError::Truncated {
            expected: need,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, WalError> {
    ensure(buf, 4)?;
    let v = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, WalError> {
    ensure(buf, 8)?;
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(u64::from_le_bytes(b))
}

fn read_i64(buf: &mut &[u8]) -> Result<i64, WalError> {
    Ok(read_u64(buf)? as i64)
}

fn read_count(buf: &mut &[u8], elem_size: usize) -> Result<usize, WalError> {
    let n = read_u32(buf)? as i32;
    if n < 0 {
        return Err(corrupt(format!("negative element count {}", n)));
    }
    let n = n as usize;
    ensure(buf, n.saturating_mul(elem_size))?;
    Ok(n)
}

fn read_xids(buf: &mut &[u8]) -> Result<Vec<Xid>, WalError> {
    let n = read_count(buf, 4)?;
    (0..n).map(|_| read_u32(buf).map(Xid)).collect()
}

fn read_rels(buf: &mut &[u8]) -> Result<Vec<RelFileNode>, WalError> {
    let n = read_count(buf, 12)?;
    let mut rels = Vec::with_capacity(n);
    for _ in 0..n {
        rels.push(RelFileNode {
            spc_node: Oid(read_u32(buf)?),
            db_node: Oid(read_u32(buf)?),
            rel_node: Oid(read_u32(buf)?),
        });
    }
    Ok(rels)
}

fn read_deldbs(buf: &mut &[u8]) -> Result<Vec<DbDirSpec>, WalError> {
    let n = read_count(buf, 8)?;
    let mut dbs = Vec::with_capacity(n);
    for _ in 0..n {
        dbs.push(DbDirSpec {
            database: Oid(read_u32(buf)?),
            tablespace: Oid(read_u32(buf)?),
        });
    }
    Ok(dbs)
}

fn read_invals(buf: &mut &[u8]) -> Result<Vec<InvalidationMessage>, WalError> {
    let n = read_count(buf, INVAL_MESSAGE_SIZE)?;
    let mut msgs = Vec::with_capacity(n);
    for _ in 0..n {
        let id = buf[0] as i8;
        *buf = &buf[4..];
        msgs.push(InvalidationMessage {
            id,
            db_id: Oid(read_u32(buf)?),
            a: read_u32(buf)?,
            b: read_u32(buf)?,
        });
    }
    Ok(msgs)
}

fn read_origin(buf: &mut &[u8]) -> Result<OriginInfo, WalError> {
    Ok(OriginInfo {
        origin_lsn: Lsn(read_u64(buf)?),
        origin_timestamp: TimestampTz(read_i64(buf)?),
    })
}

fn read_distrib(buf: &mut &[u8]) -> Result<DistribInfo, WalError> {
    Ok(DistribInfo {
        distrib_timestamp: DistribTimestamp(read_u32(buf)?),
        distrib_xid: DistribXid(read_u64(buf)?),
    })
}

fn corrupt(reason: String) -> WalError {
    WalError::Corrupt {
        lsn: Lsn::INVALID,
        reason,
    }
}

fn expect_end(buf: &[u8], what: &str) -> Result<(), WalError> {
    if !buf.is_empty() {
        return Err(corrupt(format!(
            "{} record has {} trailing bytes",
            what,
            buf.len()
        )));
    }
    Ok(())
}

fn finish_info(kind: XactRecordKind, xinfo: u32) -> u8 {
    if xinfo != 0 {
        kind.opcode() | XLOG_XACT_HAS_INFO
    } else {
        kind.opcode()
    }
}

fn read_header(buf: &mut &[u8], info: u8) -> Result<(TimestampTz, Oid, u32), WalError> {
    let xact_time = TimestampTz(read_i64(buf)?);
    let tablespace = Oid(read_u32(buf)?);
    let xinfo = if info & XLOG_XACT_HAS_INFO != 0 {
        read_u32(buf)?
    } else {
        0
    };
    let unknown = xinfo & !XACT_XINFO_KNOWN_MASK;
    if unknown != 0 {
        return Err(corrupt(format!("unknown xinfo bits {:#x}", unknown)));
    }
    Ok((xact_time, tablespace, xinfo))
}

impl CommitRecord {
    /// Record type implied by the optional blocks present.
    pub fn kind(&self) -> XactRecordKind {
        if self.twophase_xid.is_some() {
            XactRecordKind::CommitPrepared
        } else if self.distrib.is_some() {
            XactRecordKind::DistributedCommit
        } else {
            XactRecordKind::Commit
        }
    }

    pub fn xinfo(&self) -> u32 {
        let mut xinfo = self.flags & XACT_XINFO_FLAG_MASK;
        if self.db_info.is_some() {
            xinfo |= XACT_XINFO_HAS_DBINFO;
        }
        if !self.subxacts.is_empty() {
            xinfo |= XACT_XINFO_HAS_SUBXACTS;
        }
        if !self.xnodes.is_empty() {
            xinfo |= XACT_XINFO_HAS_RELFILENODES;
        }
        if !self.invals.is_empty() {
            xinfo |= XACT_XINFO_HAS_INVALS;
        }
        if !self.deldbs.is_empty() {
            xinfo |= XACT_XINFO_HAS_DELDBS;
        }
        if self.twophase_xid.is_some() {
            xinfo |= XACT_XINFO_HAS_TWOPHASE;
        }
        if self.origin.is_some() {
            xinfo |= XACT_XINFO_HAS_ORIGIN;
        }
        if self.distrib.is_some() {
            xinfo |= XACT_XINFO_HAS_DISTRIB;
        }
        xinfo
    }

    /// Returns the info byte and record body.
    pub fn encode(&self) -> (u8, Bytes) {
        let xinfo = self.xinfo();
        let mut buf = BytesMut::with_capacity(64);
        put_header(&mut buf, self.xact_time, self.tablespace_to_delete);
        if xinfo != 0 {
            buf.put_u32_le(xinfo);
        }
        if let Some(db) = &self.db_info {
            buf.put_u32_le(db.db_id.0);
            buf.put_u32_le(db.ts_id.0);
        }
        if xinfo & XACT_XINFO_HAS_SUBXACTS != 0 {
            put_xids(&mut buf, &self.subxacts);
        }
        if xinfo & XACT_XINFO_HAS_RELFILENODES != 0 {
            put_rels(&mut buf, &self.xnodes);
        }
        if xinfo & XACT_XINFO_HAS_INVALS != 0 {
            put_invals(&mut buf, &self.invals);
        }
        if xinfo & XACT_XINFO_HAS_DELDBS != 0 {
            put_deldbs(&mut buf, &self.deldbs);
        }
        if let Some(x) = self.twophase_xid {
            buf.put_u32_le(x.0);
        }
        if let Some(o) = &self.origin {
            buf.put_u64_le(o.origin_lsn.0);
            buf.put_i64_le(o.origin_timestamp.0);
        }
        if let Some(d) = &self.distrib {
            buf.put_u32_le(d.distrib_timestamp.0);
            buf.put_u64_le(d.distrib_xid.0);
        }
        (finish_info(self.kind(), xinfo), buf.freeze())
    }

    pub fn decode(info: u8, data: &[u8]) -> Result<Self, WalError> {
        let kind = XactRecordKind::from_info(info);
        if !kind.is_commit() {
            return Err(corrupt(format!("{} is not a commit record", kind.name())));
        }
        let mut buf = data;
        let (xact_time, tablespace_to_delete, xinfo) = read_header(&mut buf, info)?;
        let mut rec = CommitRecord {
            xact_time,
            tablespace_to_delete,
            flags: xinfo & XACT_XINFO_FLAG_MASK,
            ..Default::default()
        };
        if xinfo & XACT_XINFO_HAS_DBINFO != 0 {
            rec.db_info = Some(DbInfo {
                db_id: Oid(read_u32(&mut buf)?),
                ts_id: Oid(read_u32(&mut buf)?),
            });
        }
        if xinfo & XACT_XINFO_HAS_SUBXACTS != 0 {
            rec.subxacts = read_xids(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_RELFILENODES != 0 {
            rec.xnodes = read_rels(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_INVALS != 0 {
            rec.invals = read_invals(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_DELDBS != 0 {
            rec.deldbs = read_deldbs(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_TWOPHASE != 0 {
            rec.twophase_xid = Some(Xid(read_u32(&mut buf)?));
        }
        if xinfo & XACT_XINFO_HAS_ORIGIN != 0 {
            rec.origin = Some(read_origin(&mut buf)?);
        }
        if xinfo & XACT_XINFO_HAS_DISTRIB != 0 {
            rec.distrib = Some(read_distrib(&mut buf)?);
        }
        expect_end(buf, kind.name())?;
        if rec.kind() != kind {
            return Err(corrupt(format!(
                "{} record carries blocks of a {} record",
                kind.name(),
                rec.kind().name()
            )));
        }
        Ok(rec)
    }

    /// Highest xid in the committed tree.
    pub fn latest_xid(&self, xid: Xid) -> Xid {
        latest_of(xid, &self.subxacts)
    }
}

impl AbortRecord {
    pub fn kind(&self) -> XactRecordKind {
        if self.twophase_xid.is_some() {
            XactRecordKind::AbortPrepared
        } else {
            XactRecordKind::Abort
        }
    }

    pub fn xinfo(&self) -> u32 {
        let mut xinfo = self.flags & XACT_XINFO_FLAG_MASK;
        if !self.subxacts.is_empty() {
            xinfo |= XACT_XINFO_HAS_SUBXACTS;
        }
        if !self.xnodes.is_empty() {
            xinfo |= XACT_XINFO_HAS_RELFILENODES;
        }
        if !self.deldbs.is_empty() {
            xinfo |= XACT_XINFO_HAS_DELDBS;
        }
        if self.twophase_xid.is_some() {
            xinfo |= XACT_XINFO_HAS_TWOPHASE;
        }
        if self.origin.is_some() {
            xinfo |= XACT_XINFO_HAS_ORIGIN;
        }
        xinfo
    }

    pub fn encode(&self) -> (u8, Bytes) {
        let xinfo = self.xinfo();
        let mut buf = BytesMut::with_capacity(32);
        put_header(&mut buf, self.xact_time, self.tablespace_to_delete);
        if xinfo != 0 {
            buf.put_u32_le(xinfo);
        }
        if xinfo & XACT_XINFO_HAS_SUBXACTS != 0 {
            put_xids(&mut buf, &self.subxacts);
        }
        if xinfo & XACT_XINFO_HAS_RELFILENODES != 0 {
            put_rels(&mut buf, &self.xnodes);
        }
        if xinfo & XACT_XINFO_HAS_DELDBS != 0 {
            put_deldbs(&mut buf, &self.deldbs);
        }
        if let Some(x) = self.twophase_xid {
            buf.put_u32_le(x.0);
        }
        if let Some(o) = &self.origin {
            buf.put_u64_le(o.origin_lsn.0);
            buf.put_i64_le(o.origin_timestamp.0);
        }
        (finish_info(self.kind(), xinfo), buf.freeze())
    }

    pub fn decode(info: u8, data: &[u8]) -> Result<Self, WalError> {
        let kind = XactRecordKind::from_info(info);
        if !kind.is_abort() {
            return Err(corrupt(format!("{} is not an abort record", kind.name())));
        }
        let mut buf = data;
        let (xact_time, tablespace_to_delete, xinfo) = read_header(&mut buf, info)?;
        if xinfo & (XACT_XINFO_HAS_INVALS | XACT_XINFO_HAS_DISTRIB | XACT_XINFO_HAS_DBINFO) != 0 {
            return Err(corrupt(format!(
                "abort record with commit-only xinfo bits {:#x}",
                xinfo
            )));
        }
        let mut rec = AbortRecord {
            xact_time,
            tablespace_to_delete,
            flags: xinfo & XACT_XINFO_FLAG_MASK,
            ..Default::default()
        };
        if xinfo & XACT_XINFO_HAS_SUBXACTS != 0 {
            rec.subxacts = read_xids(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_RELFILENODES != 0 {
            rec.xnodes = read_rels(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_DELDBS != 0 {
            rec.deldbs = read_deldbs(&mut buf)?;
        }
        if xinfo & XACT_XINFO_HAS_TWOPHASE != 0 {
            rec.twophase_xid = Some(Xid(read_u32(&mut buf)?));
        }
        if xinfo & XACT_XINFO_HAS_ORIGIN != 0 {
            rec.origin = Some(read_origin(&mut buf)?);
        }
        expect_end(buf, kind.name())?;
        if rec.kind() != kind {
            return Err(corrupt(format!(
                "{} record carries blocks of a {} record",
                kind.name(),
                rec.kind().name()
            )));
        }
        Ok(rec)
    }

    pub fn latest_xid(&self, xid: Xid) -> Xid {
        latest_of(xid, &self.subxacts)
    }
}

impl AssignmentRecord {
    pub fn encode(&self) -> (u8, Bytes) {
        let mut buf = BytesMut::with_capacity(8 + 4 * self.xsub.len());
        buf.put_u32_le(self.xtop.0);
        put_xids(&mut buf, &self.xsub);
        (XLOG_XACT_ASSIGNMENT, buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WalError> {
        let mut buf = data;
        let xtop = Xid(read_u32(&mut buf)?);
        let xsub = read_xids(&mut buf)?;
        expect_end(buf, "ASSIGNMENT")?;
        Ok(Self { xtop, xsub })
    }
}

impl DistributedForgetRecord {
    pub fn encode(&self) -> (u8, Bytes) {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32_le(self.distrib_timestamp.0);
        buf.put_u64_le(self.distrib_xid.0);
        (XLOG_XACT_DISTRIBUTED_FORGET, buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WalError> {
        let mut buf = data;
        let d = read_distrib(&mut buf)?;
        expect_end(buf, "DISTRIBUTED_FORGET")?;
        Ok(Self {
            distrib_timestamp: d.distrib_timestamp,
            distrib_xid: d.distrib_xid,
        })
    }
}

/// Highest of `xid` and `subxacts` in xid order.
pub fn latest_of(xid: Xid, subxacts: &[Xid]) -> Xid {
    subxacts.iter().fold(xid, |acc, &x| {
        if !acc.is_valid() || acc.precedes(x) {
            x
        } else {
            acc
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_commit_has_no_xinfo() {
        let rec = CommitRecord {
            xact_time: TimestampTz(42),
            ..Default::default()
        };
        let (info, body) = rec.encode();
        assert_eq!(info, XLOG_XACT_COMMIT);
        assert_eq!(body.len(), 12);
        assert_eq!(CommitRecord::decode(info, &body).unwrap(), rec);
    }

    #[test]
    fn test_record_kind_selection() {
        let mut rec = CommitRecord::default();
        rec.distrib = Some(DistribInfo {
            distrib_timestamp: DistribTimestamp(1),
            distrib_xid: DistribXid(2),
        });
        assert_eq!(rec.kind(), XactRecordKind::DistributedCommit);
        rec.twophase_xid = Some(Xid(77));
        assert_eq!(rec.kind(), XactRecordKind::CommitPrepared);

        let abort = AbortRecord {
            twophase_xid: Some(Xid(5)),
            ..Default::default()
        };
        assert_eq!(abort.encode().0 & XLOG_XACT_OPMASK, XLOG_XACT_ABORT_PREPARED);
    }

    #[test]
    fn test_decode_rejects_unknown_xinfo_bits() {
        let rec = CommitRecord {
            subxacts: vec![Xid(8)],
            ..Default::default()
        };
        let (info, body) = rec.encode();
        let mut patched = body.to_vec();
        // xinfo follows the 12-byte header
        let xinfo = u32::from_le_bytes([patched[12], patched[13], patched[14], patched[15]]);
        patched[12..16].copy_from_slice(&(xinfo | 1 << 7).to_le_bytes());
        let err = CommitRecord::decode(info, &patched).unwrap_err();
        assert!(err.to_string().contains("unknown xinfo bits 0x80"));

        let (info, body) = AbortRecord {
            subxacts: vec![Xid(8)],
            ..Default::default()
        }
        .encode();
        let mut patched = body.to_vec();
        patched[15] |= 0x10; // bit 28
        assert!(AbortRecord::decode(info, &patched).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let (info, body) = CommitRecord::default().encode();
        let mut padded = body.to_vec();
        padded.push(0);
        assert!(matches!(
            CommitRecord::decode(info, &padded),
            Err(WalError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_block() {
        let rec = CommitRecord {
            subxacts: vec![Xid(10), Xid(11)],
            ..Default::default()
        };
        let (info, body) = rec.encode();
        assert!(matches!(
            CommitRecord::decode(info, &body[..body.len() - 2]),
            Err(WalError::Truncated { .. })
        ));
    }

    #[test]
    fn test_abort_rejects_commit_only_bits() {
        let rec = CommitRecord {
            invals: vec![InvalidationMessage {
                id: -1,
                db_id: Oid(1),
                a: 2,
                b: 3,
            }],
            ..Default::default()
        };
        let (_, body) = rec.encode();
        let info = XLOG_XACT_ABORT | XLOG_XACT_HAS_INFO;
        assert!(AbortRecord::decode(info, &body).is_err());
    }

    #[test]
    fn test_latest_of_uses_xid_order() {
        assert_eq!(latest_of(Xid(100), &[Xid(101), Xid(105)]), Xid(105));
        assert_eq!(latest_of(Xid(100), &[]), Xid(100));
        assert_eq!(latest_of(Xid(u32::MAX), &[Xid(3)]), Xid(3));
    }
}
