//! Shared snapshot slots.
//!
//! Every distributed session has one writer process on a node and any number
//! of reader processes. The writer owns a slot keyed by the session id and
//! publishes its snapshot there; readers attach to the same slot and use
//! the published snapshot verbatim, so all of them see exactly what the
//! writer sees.
//!
//! Slot creation and lookup race (a reader may start before its writer), so
//! both poll with the configured retry interval until the add timeout.
//! A slot's contents are only trusted once its `ready` flag is set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};
use meridian_common::cancel::CancelToken;
use meridian_common::config::MeridianConfig;
use meridian_common::error::{MeridianError, MeridianResult, SnapshotError};
use meridian_common::types::{BackendId, CommandId, DistribXid, SessionId, TimestampTz, Xid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::snapshot::{ComboCid, Snapshot};

/// Everything a writer makes visible to its readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedSnapshot {
    pub xid: Xid,
    pub cid: CommandId,
    pub start_timestamp: TimestampTz,
    /// Coordinator's distributed xid and command id for this statement.
    pub qd_xid: DistribXid,
    pub qd_cid: CommandId,
    /// Bumped by the writer for every statement it publishes for.
    pub segmate_sync: u32,
    pub snapshot: Snapshot,
    pub combocids: Vec<ComboCid>,
    pub subxids: Vec<Xid>,
}

#[derive(Debug, Default)]
struct SlotData {
    session: Option<SessionId>,
    pid: u32,
    writer: Option<BackendId>,
    published: PublishedSnapshot,
    /// `published.subxids` holds only the in-memory prefix; the rest is in
    /// the spill file.
    total_subcnt: usize,
    spill_path: Option<PathBuf>,
}

struct SnapshotSlot {
    ready: AtomicBool,
    data: RwLock<SlotData>,
}

#[derive(Debug)]
struct SlotDirectory {
    num_slots: usize,
    /// Lowest free index, `None` when the table is full.
    next_slot: Option<usize>,
    slot_ids: Vec<Option<SessionId>>,
}

/// Key of a cursor snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSnapshotKey {
    pub session: SessionId,
    pub writer_pid: u32,
    pub qd_xid: DistribXid,
    pub qd_cid: CommandId,
    pub segmate_sync: u32,
}

impl CursorSnapshotKey {
    pub fn file_name(&self) -> String {
        format!(
            "sess{}_w{}_qdxid{}_qdcid{}_sync{}",
            self.session.0, self.writer_pid, self.qd_xid.0, self.qd_cid.0, self.segmate_sync
        )
    }
}

#[derive(Debug, Serialize)]
struct SlotSummary {
    index: usize,
    session: i32,
    pid: u32,
    ready: bool,
    xid: u32,
    cid: u32,
    qd_xid: u64,
    segmate_sync: u32,
    xmin: u32,
    xmax: u32,
    xcnt: usize,
    total_subcnt: usize,
}

pub struct SharedSnapshotTable {
    slots: Box<[SnapshotSlot]>,
    dir: RwLock<SlotDirectory>,
    max_xip: usize,
    max_inmemory_subxids: usize,
    retry_interval: std::time::Duration,
    max_retries: u64,
    scratch_dir: PathBuf,
}

impl SharedSnapshotTable {
    pub fn new(config: &MeridianConfig) -> Self {
        let n = config.shared_snapshot_slots();
        let slots: Vec<SnapshotSlot> = (0..n)
            .map(|_| SnapshotSlot {
                ready: AtomicBool::new(false),
                data: RwLock::new(SlotData::default()),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            dir: RwLock::new(SlotDirectory {
                num_slots: 0,
                next_slot: if n > 0 { Some(0) } else { None },
                slot_ids: vec![None; n],
            }),
            max_xip: config.max_xip(),
            max_inmemory_subxids: config.shared_snapshot.max_inmemory_subxids,
            retry_interval: config.shared_snapshot.retry_interval(),
            max_retries: config.shared_snapshot.max_retries(),
            scratch_dir: config.shared_snapshot.scratch_path(),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_slots(&self) -> usize {
        self.dir.read().num_slots
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Claim a slot for `session`. Called once by the session's writer.
    ///
    /// A slot still held under the same id belongs to a previous writer that
    /// has not finished exiting; wait for it up to the add timeout.
    pub fn add(
        &self,
        session: SessionId,
        pid: u32,
        writer: BackendId,
        cancel: &CancelToken,
    ) -> MeridianResult<usize> {
        let mut retries = 0u64;
        loop {
            {
                let mut dir = self.dir.write();
                if !dir.slot_ids.iter().any(|s| *s == Some(session)) {
                    let index = dir.next_slot.ok_or(SnapshotError::TooManySlots {
                        max: self.slots.len(),
                    })?;
                    dir.slot_ids[index] = Some(session);
                    dir.num_slots += 1;
                    let next = (index + 1..dir.slot_ids.len()).find(|&i| dir.slot_ids[i].is_none());
                    dir.next_slot = next;

                    let slot = &self.slots[index];
                    slot.ready.store(false, Ordering::Release);
                    *slot.data.write() = SlotData {
                        session: Some(session),
                        pid,
                        writer: Some(writer),
                        ..Default::default()
                    };
                    metrics::gauge!("meridian_shared_snapshot_slots").set(dir.num_slots as f64);
                    tracing::debug!(
                        "shared snapshot: slot {} added for session {} (writer pid {}), {} in use",
                        index,
                        session,
                        pid,
                        dir.num_slots
                    );
                    return Ok(index);
                }
            }
            if retries >= self.max_retries {
                tracing::error!(
                    "shared snapshot: session {} still owns a slot after {} retries",
                    session,
                    retries
                );
                return Err(SnapshotError::SlotCollision(session).into());
            }
            if retries == 0 {
                tracing::warn!(
                    "shared snapshot: slot for session {} is still in use, waiting",
                    session
                );
            }
            retries += 1;
            cancel.check()?;
            cancel.sleep(self.retry_interval);
        }
    }

    fn find(&self, session: SessionId) -> Option<usize> {
        self.dir
            .read()
            .slot_ids
            .iter()
            .position(|s| *s == Some(session))
    }

    /// Find the slot of `session`, polling until its writer has created it.
    pub fn lookup(&self, session: SessionId, cancel: &CancelToken) -> MeridianResult<usize> {
        let started = Instant::now();
        let mut retries = 0u64;
        loop {
            if let Some(index) = self.find(session) {
                return Ok(index);
            }
            if retries >= self.max_retries {
                return Err(SnapshotError::NotFound {
                    session,
                    waited_ms: started.elapsed().as_millis() as u64,
                }
                .into());
            }
            retries += 1;
            cancel.check()?;
            cancel.sleep(self.retry_interval);
        }
    }

    /// Release the writer's slot.
    pub fn remove(&self, index: usize, session: SessionId) -> MeridianResult<()> {
        let mut dir = self.dir.write();
        if dir.slot_ids.get(index).copied().flatten() != Some(session) {
            return Err(MeridianError::internal_bug(
                "SNAP-001",
                format!("session {} does not own shared snapshot slot {}", session, index),
                format!("slot_ids={:?}", dir.slot_ids),
            ));
        }
        let slot = &self.slots[index];
        slot.ready.store(false, Ordering::Release);
        let old = std::mem::take(&mut *slot.data.write());
        if let Some(path) = old.spill_path {
            remove_quietly(&path);
        }
        dir.slot_ids[index] = None;
        dir.num_slots -= 1;
        if dir.next_slot.map_or(true, |next| index < next) {
            dir.next_slot = Some(index);
        }
        metrics::gauge!("meridian_shared_snapshot_slots").set(dir.num_slots as f64);
        tracing::debug!(
            "shared snapshot: slot {} of session {} removed, {} in use",
            index,
            session,
            dir.num_slots
        );
        Ok(())
    }

    /// Publish a new snapshot. Readers see either the previous one or this
    /// one, never a mix.
    pub fn publish(&self, index: usize, mut published: PublishedSnapshot) -> MeridianResult<()> {
        let xcnt = published.snapshot.xip.len();
        if xcnt > self.max_xip {
            return Err(SnapshotError::XipOverflow {
                xcnt,
                max: self.max_xip,
            }
            .into());
        }
        let slot = &self.slots[index];
        slot.ready.store(false, Ordering::Release);
        {
            let mut data = slot.data.write();
            let session = data.session.ok_or_else(|| {
                MeridianError::internal_bug("SNAP-002", "publish into a free slot", format!("index={}", index))
            })?;
            if let Some(path) = data.spill_path.take() {
                remove_quietly(&path);
            }
            data.total_subcnt = published.subxids.len();
            if published.subxids.len() > self.max_inmemory_subxids {
                let spilled = published.subxids.split_off(self.max_inmemory_subxids);
                let path = self
                    .scratch_dir
                    .join(format!("sess{}_subxids_{}", session.0, index));
                write_spill(&path, &spilled)?;
                data.spill_path = Some(path);
            }
            data.published = published;
        }
        slot.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Refresh the transaction fields without republishing the snapshot.
    pub fn update_xact_info(
        &self,
        index: usize,
        xid: Xid,
        cid: CommandId,
        start_timestamp: TimestampTz,
        qd_xid: DistribXid,
    ) {
        let mut data = self.slots[index].data.write();
        data.published.xid = xid;
        data.published.cid = cid;
        data.published.start_timestamp = start_timestamp;
        data.published.qd_xid = qd_xid;
    }

    /// The writer's current xid as published in slot `index`.
    pub fn slot_xid(&self, index: usize) -> Xid {
        self.slots[index].data.read().published.xid
    }

    pub fn writer_backend(&self, index: usize) -> Option<BackendId> {
        self.slots[index].data.read().writer
    }

    pub fn is_ready(&self, index: usize) -> bool {
        self.slots[index].ready.load(Ordering::Acquire)
    }

    /// Read the published snapshot, waiting for the writer to finish
    /// publishing.
    pub fn read(
        &self,
        index: usize,
        session: SessionId,
        cancel: &CancelToken,
    ) -> MeridianResult<PublishedSnapshot> {
        self.read_when(index, session, cancel, |_| true)
    }

    /// Like [`read`](Self::read), but wait until the writer has published
    /// for statement `segmate_sync`.
    pub fn read_synced(
        &self,
        index: usize,
        session: SessionId,
        segmate_sync: u32,
        cancel: &CancelToken,
    ) -> MeridianResult<PublishedSnapshot> {
        self.read_when(index, session, cancel, |p| p.segmate_sync == segmate_sync)
    }

    fn read_when(
        &self,
        index: usize,
        session: SessionId,
        cancel: &CancelToken,
        wanted: impl Fn(&PublishedSnapshot) -> bool,
    ) -> MeridianResult<PublishedSnapshot> {
        let slot = &self.slots[index];
        let mut retries = 0u64;
        loop {
            if slot.ready.load(Ordering::Acquire) {
                let data = slot.data.read();
                if data.session != Some(session) {
                    return Err(SnapshotError::NotFound {
                        session,
                        waited_ms: 0,
                    }
                    .into());
                }
                if wanted(&data.published) {
                    let mut out = data.published.clone();
                    if let Some(path) = &data.spill_path {
                        out.subxids.extend(read_spill(path)?);
                    }
                    debug_assert_eq!(out.subxids.len(), data.total_subcnt);
                    return Ok(out);
                }
            }
            if retries >= self.max_retries {
                return Err(SnapshotError::NotReady(session).into());
            }
            retries += 1;
            cancel.check()?;
            cancel.sleep(self.retry_interval);
        }
    }

    /// Lookup followed by read: what a reader does at statement start.
    pub fn lookup_snapshot(
        &self,
        session: SessionId,
        cancel: &CancelToken,
    ) -> MeridianResult<PublishedSnapshot> {
        let index = self.lookup(session, cancel)?;
        self.read(index, session, cancel)
    }

    // ── Cursor snapshots ──

    fn cursor_key(&self, index: usize) -> MeridianResult<CursorSnapshotKey> {
        let data = self.slots[index].data.read();
        let session = data.session.ok_or_else(|| {
            MeridianError::internal_bug("SNAP-003", "cursor dump from a free slot", format!("index={}", index))
        })?;
        Ok(CursorSnapshotKey {
            session,
            writer_pid: data.pid,
            qd_xid: data.published.qd_xid,
            qd_cid: data.published.qd_cid,
            segmate_sync: data.published.segmate_sync,
        })
    }

    /// Write the slot's full snapshot to a scratch file so readers of a
    /// cursor can find it after the declaring statement has finished.
    pub fn dump_for_cursor(&self, index: usize, cancel: &CancelToken) -> MeridianResult<CursorSnapshotKey> {
        let key = self.cursor_key(index)?;
        let published = self.read(index, key.session, cancel)?;
        let path = self.scratch_dir.join(key.file_name());
        let body = encode_cursor_snapshot(key.writer_pid, &published);
        let mut buf = BytesMut::with_capacity(body.len() + 4);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        std::fs::write(&path, &buf).map_err(|e| cursor_err(&path, e.to_string()))?;
        tracing::debug!("shared snapshot: cursor snapshot written to {}", path.display());
        Ok(key)
    }

    pub fn read_for_cursor(&self, key: &CursorSnapshotKey) -> MeridianResult<PublishedSnapshot> {
        let path = self.scratch_dir.join(key.file_name());
        let raw = std::fs::read(&path).map_err(|e| cursor_err(&path, e.to_string()))?;
        let mut buf = &raw[..];
        if buf.remaining() < 4 {
            return Err(cursor_err(&path, "missing length prefix".into()));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() != len {
            return Err(cursor_err(
                &path,
                format!("length prefix {} but {} bytes follow", len, buf.remaining()),
            ));
        }
        let (pid, mut published) =
            decode_cursor_snapshot(buf).ok_or_else(|| cursor_err(&path, "truncated body".into()))?;
        if pid != key.writer_pid {
            return Err(cursor_err(
                &path,
                format!("written by pid {}, expected {}", pid, key.writer_pid),
            ));
        }
        published.qd_xid = key.qd_xid;
        published.qd_cid = key.qd_cid;
        published.segmate_sync = key.segmate_sync;
        Ok(published)
    }

    /// Delete every cursor snapshot file of `session`.
    pub fn remove_cursor_files(&self, session: SessionId) -> usize {
        let prefix = format!("sess{}_w", session.0);
        let entries = match std::fs::read_dir(&self.scratch_dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                remove_quietly(&entry.path());
                removed += 1;
            }
        }
        removed
    }

    /// JSON listing of slots in use.
    pub fn dump(&self) -> MeridianResult<String> {
        let dir = self.dir.read();
        let mut out = Vec::with_capacity(dir.num_slots);
        for (index, id) in dir.slot_ids.iter().enumerate() {
            let Some(session) = id else { continue };
            let slot = &self.slots[index];
            let data = slot.data.read();
            out.push(SlotSummary {
                index,
                session: session.0,
                pid: data.pid,
                ready: slot.ready.load(Ordering::Acquire),
                xid: data.published.xid.0,
                cid: data.published.cid.0,
                qd_xid: data.published.qd_xid.0,
                segmate_sync: data.published.segmate_sync,
                xmin: data.published.snapshot.xmin.0,
                xmax: data.published.snapshot.xmax.0,
                xcnt: data.published.snapshot.xip.len(),
                total_subcnt: data.total_subcnt,
            });
        }
        serde_json::to_string_pretty(&out).map_err(|e| MeridianError::Serialization(e.to_string()))
    }
}

fn cursor_err(path: &Path, reason: String) -> MeridianError {
    SnapshotError::CursorFile {
        path: path.display().to_string(),
        reason,
    }
    .into()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("shared snapshot: could not remove {}: {}", path.display(), e);
        }
    }
}

fn write_spill(path: &Path, xids: &[Xid]) -> MeridianResult<()> {
    let mut buf = BytesMut::with_capacity(4 + xids.len() * 4);
    buf.put_u32_le(xids.len() as u32);
    for x in xids {
        buf.put_u32_le(x.0);
    }
    std::fs::write(path, &buf).map_err(|e| cursor_err(path, e.to_string()))
}

fn read_spill(path: &Path) -> MeridianResult<Vec<Xid>> {
    let raw = std::fs::read(path).map_err(|e| cursor_err(path, e.to_string()))?;
    let mut buf = &raw[..];
    if buf.remaining() < 4 {
        return Err(cursor_err(path, "truncated sub-xid spill file".into()));
    }
    let n = buf.get_u32_le() as usize;
    if buf.remaining() != n * 4 {
        return Err(cursor_err(path, "truncated sub-xid spill file".into()));
    }
    Ok((0..n).map(|_| Xid(buf.get_u32_le())).collect())
}

// pid, xid, cid, start_ts, combocids, xmin, xmax, xip, curcid,
// suboverflowed, subxip, subxids
fn encode_cursor_snapshot(pid: u32, p: &PublishedSnapshot) -> BytesMut {
    let xids = p.snapshot.xip.len() + p.snapshot.subxip.len() + p.subxids.len();
    let mut buf = BytesMut::with_capacity(45 + p.combocids.len() * 8 + xids * 4);
    buf.put_u32_le(pid);
    buf.put_u32_le(p.xid.0);
    buf.put_u32_le(p.cid.0);
    buf.put_i64_le(p.start_timestamp.0);
    buf.put_u32_le(p.combocids.len() as u32);
    for c in &p.combocids {
        buf.put_u32_le(c.cmin.0);
        buf.put_u32_le(c.cmax.0);
    }
    buf.put_u32_le(p.snapshot.xmin.0);
    buf.put_u32_le(p.snapshot.xmax.0);
    buf.put_u32_le(p.snapshot.xip.len() as u32);
    for x in &p.snapshot.xip {
        buf.put_u32_le(x.0);
    }
    buf.put_u32_le(p.snapshot.curcid.0);
    buf.put_u8(u8::from(p.snapshot.suboverflowed));
    buf.put_u32_le(p.snapshot.subxip.len() as u32);
    for x in &p.snapshot.subxip {
        buf.put_u32_le(x.0);
    }
    buf.put_u32_le(p.subxids.len() as u32);
    for x in &p.subxids {
        buf.put_u32_le(x.0);
    }
    buf
}

fn get_u32s(buf: &mut &[u8]) -> Option<Vec<u32>> {
    if buf.remaining() < 4 {
        return None;
    }
    let n = buf.get_u32_le() as usize;
    if buf.remaining() < n.checked_mul(4)? {
        return None;
    }
    Some((0..n).map(|_| buf.get_u32_le()).collect())
}

fn decode_cursor_snapshot(mut buf: &[u8]) -> Option<(u32, PublishedSnapshot)> {
    if buf.remaining() < 24 {
        return None;
    }
    let pid = buf.get_u32_le();
    let xid = Xid(buf.get_u32_le());
    let cid = CommandId(buf.get_u32_le());
    let start_timestamp = TimestampTz(buf.get_i64_le());
    let ncombo = buf.get_u32_le() as usize;
    if buf.remaining() < ncombo.checked_mul(8)? {
        return None;
    }
    let combocids = (0..ncombo)
        .map(|_| ComboCid {
            cmin: CommandId(buf.get_u32_le()),
            cmax: CommandId(buf.get_u32_le()),
        })
        .collect();
    if buf.remaining() < 8 {
        return None;
    }
    let xmin = Xid(buf.get_u32_le());
    let xmax = Xid(buf.get_u32_le());
    let xip = get_u32s(&mut buf)?.into_iter().map(Xid).collect();
    if buf.remaining() < 5 {
        return None;
    }
    let curcid = CommandId(buf.get_u32_le());
    let suboverflowed = match buf.get_u8() {
        0 => false,
        1 => true,
        _ => return None,
    };
    let subxip = get_u32s(&mut buf)?.into_iter().map(Xid).collect();
    let subxids = get_u32s(&mut buf)?.into_iter().map(Xid).collect();
    if buf.has_remaining() {
        return None;
    }
    Some((
        pid,
        PublishedSnapshot {
            xid,
            cid,
            start_timestamp,
            snapshot: Snapshot {
                xmin,
                xmax,
                xip,
                subxip,
                suboverflowed,
                curcid,
            },
            combocids,
            subxids,
            ..Default::default()
        },
    ))
}
