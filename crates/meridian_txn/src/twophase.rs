//! Prepared (two-phase) transactions.
//!
//! A prepared transaction outlives the backend that prepared it: its xid
//! stays running through a dummy process slot, its locks move to that slot,
//! and everything needed to finish it later is kept here and in a state
//! file under `<data_dir>/twophase/`.
//!
//! State file format: `[len: u32 LE][crc32: u32 LE][bincode payload]`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use meridian_common::error::{MeridianError, MeridianResult, TwoPhaseError};
use meridian_common::types::{BackendId, Lsn, Oid, RelFileNode, TimestampTz, Xid};
use meridian_storage::xact_record::{DistribInfo, InvalidationMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::lock::{LockMode, LockTag};

/// GIDs of this many bytes or more are rejected.
pub const GID_MAX_LEN: usize = 200;

const STATE_DIR: &str = "twophase";

/// Everything a different backend needs to finish a prepared transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTransactionData {
    pub gid: String,
    pub xid: Xid,
    pub subxids: Vec<Xid>,
    pub database: Oid,
    pub owner: Oid,
    pub prepared_at: TimestampTz,
    pub prepare_lsn: Lsn,
    pub locks: Vec<(LockTag, LockMode)>,
    /// Relation files to drop if the transaction commits.
    pub commit_rels: Vec<RelFileNode>,
    /// Relation files to drop if it aborts.
    pub abort_rels: Vec<RelFileNode>,
    pub invals: Vec<InvalidationMessage>,
    pub distrib: Option<DistribInfo>,
}

#[derive(Debug)]
struct GxactEntry {
    data: GlobalTransactionData,
    /// False between `mark_as_preparing` and `end_prepare`.
    valid: bool,
    /// Backend preparing or finishing the transaction.
    locking_backend: Option<BackendId>,
    dummy_proc: Option<usize>,
}

/// A prepared transaction claimed for `COMMIT PREPARED` / `ROLLBACK PREPARED`.
#[derive(Debug, Clone)]
pub struct FinishClaim {
    pub data: GlobalTransactionData,
    pub dummy_proc: Option<usize>,
}

pub struct TwoPhaseState {
    entries: Mutex<HashMap<String, GxactEntry>>,
    max_prepared: usize,
    dir: Option<PathBuf>,
}

impl TwoPhaseState {
    /// `data_dir = None` keeps state in memory only.
    pub fn new(max_prepared: usize, data_dir: Option<&Path>) -> MeridianResult<Self> {
        let dir = match data_dir {
            Some(d) => {
                let dir = d.join(STATE_DIR);
                fs::create_dir_all(&dir).map_err(|e| state_err(&dir, e.to_string()))?;
                Some(dir)
            }
            None => None,
        };
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            max_prepared,
            dir,
        })
    }

    pub fn max_prepared(&self) -> usize {
        self.max_prepared
    }

    /// Reserve `gid` for a transaction about to prepare.
    pub fn mark_as_preparing(
        &self,
        gid: &str,
        xid: Xid,
        database: Oid,
        owner: Oid,
        backend: BackendId,
    ) -> MeridianResult<()> {
        if gid.len() >= GID_MAX_LEN {
            return Err(TwoPhaseError::GidTooLong(gid.to_string()).into());
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(gid) {
            return Err(TwoPhaseError::DuplicateGid(gid.to_string()).into());
        }
        if entries.len() >= self.max_prepared {
            return Err(TwoPhaseError::TooManyPrepared {
                max: self.max_prepared,
            }
            .into());
        }
        entries.insert(
            gid.to_string(),
            GxactEntry {
                data: GlobalTransactionData {
                    gid: gid.to_string(),
                    xid,
                    subxids: Vec::new(),
                    database,
                    owner,
                    prepared_at: TimestampTz::now(),
                    prepare_lsn: Lsn::INVALID,
                    locks: Vec::new(),
                    commit_rels: Vec::new(),
                    abort_rels: Vec::new(),
                    invals: Vec::new(),
                    distrib: None,
                },
                valid: false,
                locking_backend: Some(backend),
                dummy_proc: None,
            },
        );
        Ok(())
    }

    /// Complete a prepare: persist the state and make the entry visible to
    /// `lock_for_finish`.
    pub fn end_prepare(&self, data: GlobalTransactionData, dummy_proc: usize) -> MeridianResult<()> {
        self.write_state_file(&data)?;
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&data.gid).ok_or_else(|| {
            MeridianError::internal_bug(
                "2PC-001",
                format!("gid {} vanished while preparing", data.gid),
                format!("xid={}", data.xid),
            )
        })?;
        entry.data = data;
        entry.valid = true;
        entry.locking_backend = None;
        entry.dummy_proc = Some(dummy_proc);
        Ok(())
    }

    /// Drop a reservation after a failed prepare, leaving no trace of it.
    pub fn forget(&self, gid: &str) {
        let removed = self.entries.lock().remove(gid);
        if let Some(entry) = removed {
            self.remove_state_file(entry.data.xid);
        }
    }

    pub fn lock_for_finish(&self, gid: &str, backend: BackendId) -> MeridianResult<FinishClaim> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(gid)
            .filter(|e| e.valid)
            .ok_or_else(|| TwoPhaseError::NotFound(gid.to_string()))?;
        if entry.locking_backend.is_some() {
            return Err(TwoPhaseError::Busy(gid.to_string()).into());
        }
        entry.locking_backend = Some(backend);
        Ok(FinishClaim {
            data: entry.data.clone(),
            dummy_proc: entry.dummy_proc,
        })
    }

    /// Give up a claim without finishing the transaction.
    pub fn unlock(&self, gid: &str) {
        if let Some(entry) = self.entries.lock().get_mut(gid) {
            entry.locking_backend = None;
        }
    }

    /// Finished: forget the transaction and its state file.
    pub fn remove(&self, gid: &str) -> Option<GlobalTransactionData> {
        let removed = self.entries.lock().remove(gid)?;
        self.remove_state_file(removed.data.xid);
        Some(removed.data)
    }

    pub fn remove_by_xid(&self, xid: Xid) -> Option<GlobalTransactionData> {
        let gid = self.gid_of(xid)?;
        self.remove(&gid)
    }

    pub fn gid_of(&self, xid: Xid) -> Option<String> {
        self.entries
            .lock()
            .values()
            .find(|e| e.data.xid == xid)
            .map(|e| e.data.gid.clone())
    }

    /// Re-create an entry during redo or startup. No dummy slot yet.
    pub fn recreate(&self, data: GlobalTransactionData) {
        let mut entries = self.entries.lock();
        tracing::debug!("two-phase: recreating {} (xid {})", data.gid, data.xid);
        entries.insert(
            data.gid.clone(),
            GxactEntry {
                data,
                valid: true,
                locking_backend: None,
                dummy_proc: None,
            },
        );
    }

    pub fn set_dummy_proc(&self, gid: &str, dummy_proc: usize) {
        if let Some(entry) = self.entries.lock().get_mut(gid) {
            entry.dummy_proc = Some(dummy_proc);
        }
    }

    /// Valid entries that have no dummy slot yet.
    pub fn without_dummy(&self) -> Vec<GlobalTransactionData> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.valid && e.dummy_proc.is_none())
            .map(|e| e.data.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<GlobalTransactionData> {
        let mut out: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.valid)
            .map(|e| e.data.clone())
            .collect();
        out.sort_by(|a, b| a.xid.cmp_logical(&b.xid));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── State files ──

    fn state_path(&self, xid: Xid) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{:08X}", xid.0)))
    }

    fn write_state_file(&self, data: &GlobalTransactionData) -> MeridianResult<()> {
        let Some(path) = self.state_path(data.xid) else {
            return Ok(());
        };
        let payload =
            bincode::serialize(data).map_err(|e| MeridianError::Serialization(e.to_string()))?;
        let mut buf = Vec::with_capacity(payload.len() + 8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf).map_err(|e| state_err(&tmp, e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| state_err(&path, e.to_string()))?;
        Ok(())
    }

    fn remove_state_file(&self, xid: Xid) {
        if let Some(path) = self.state_path(xid) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("two-phase: could not remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Read every state file. A damaged file is an error: silently dropping
    /// a prepared transaction would lose a commit the coordinator may
    /// already have acknowledged.
    pub fn read_state_files(&self) -> MeridianResult<Vec<GlobalTransactionData>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| state_err(dir, e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| state_err(dir, e.to_string()))?;
            let path = entry.path();
            if path.extension().is_some() {
                continue;
            }
            out.push(read_state_file(&path)?);
        }
        out.sort_by(|a, b| a.xid.cmp_logical(&b.xid));
        Ok(out)
    }

    pub fn discard_state_file(&self, xid: Xid) {
        self.remove_state_file(xid);
    }
}

fn read_state_file(path: &Path) -> MeridianResult<GlobalTransactionData> {
    let raw = fs::read(path).map_err(|e| state_err(path, e.to_string()))?;
    if raw.len() < 8 {
        return Err(state_err(path, "file too short".into()));
    }
    let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let crc = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let payload = &raw[8..];
    if payload.len() != len {
        return Err(state_err(
            path,
            format!("length {} but {} bytes follow", len, payload.len()),
        ));
    }
    if crc32fast::hash(payload) != crc {
        return Err(state_err(path, "checksum mismatch".into()));
    }
    bincode::deserialize(payload).map_err(|e| state_err(path, e.to_string()))
}

fn state_err(path: &Path, reason: String) -> MeridianError {
    TwoPhaseError::StateFile {
        path: path.display().to_string(),
        reason,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(gid: &str, xid: u32) -> GlobalTransactionData {
        GlobalTransactionData {
            gid: gid.into(),
            xid: Xid(xid),
            subxids: vec![Xid(xid + 1)],
            database: Oid(1),
            owner: Oid(10),
            prepared_at: TimestampTz(5),
            prepare_lsn: Lsn(64),
            locks: vec![(LockTag::Transaction(Xid(xid)), LockMode::Exclusive)],
            commit_rels: Vec::new(),
            abort_rels: Vec::new(),
            invals: Vec::new(),
            distrib: None,
        }
    }

    #[test]
    fn test_gid_rules() {
        let tp = TwoPhaseState::new(1, None).unwrap();
        let long = "g".repeat(GID_MAX_LEN);
        assert!(matches!(
            tp.mark_as_preparing(&long, Xid(5), Oid(1), Oid(10), BackendId(0)),
            Err(MeridianError::TwoPhase(TwoPhaseError::GidTooLong(_)))
        ));
        tp.mark_as_preparing("a", Xid(5), Oid(1), Oid(10), BackendId(0))
            .unwrap();
        let dup = tp
            .mark_as_preparing("a", Xid(6), Oid(1), Oid(10), BackendId(1))
            .unwrap_err();
        assert_eq!(dup.pg_sqlstate(), "42710");
        assert!(matches!(
            tp.mark_as_preparing("b", Xid(7), Oid(1), Oid(10), BackendId(1)),
            Err(MeridianError::TwoPhase(TwoPhaseError::TooManyPrepared { max: 1 }))
        ));
    }

    #[test]
    fn test_not_finishable_until_prepared() {
        let tp = TwoPhaseState::new(4, None).unwrap();
        tp.mark_as_preparing("g1", Xid(5), Oid(1), Oid(10), BackendId(0))
            .unwrap();
        assert!(tp.lock_for_finish("g1", BackendId(1)).is_err());
        tp.end_prepare(data("g1", 5), 7).unwrap();
        let claim = tp.lock_for_finish("g1", BackendId(1)).unwrap();
        assert_eq!(claim.dummy_proc, Some(7));
        let busy = tp.lock_for_finish("g1", BackendId(2)).unwrap_err();
        assert!(busy.is_retryable());
        tp.unlock("g1");
        assert!(tp.lock_for_finish("g1", BackendId(2)).is_ok());
        assert_eq!(tp.remove("g1").map(|d| d.xid), Some(Xid(5)));
        assert!(tp.is_empty());
    }

    #[test]
    fn test_state_files_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tp = TwoPhaseState::new(4, Some(dir.path())).unwrap();
            for (gid, xid) in [("g1", 10), ("g2", 20)] {
                tp.mark_as_preparing(gid, Xid(xid), Oid(1), Oid(10), BackendId(0))
                    .unwrap();
                tp.end_prepare(data(gid, xid), 0).unwrap();
            }
            tp.remove("g1");
        }
        let tp = TwoPhaseState::new(4, Some(dir.path())).unwrap();
        let files = tp.read_state_files().unwrap();
        assert_eq!(files, vec![data("g2", 20)]);
    }

    #[test]
    fn test_forget_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let tp = TwoPhaseState::new(4, Some(dir.path())).unwrap();
        tp.mark_as_preparing("g", Xid(9), Oid(1), Oid(10), BackendId(0))
            .unwrap();
        tp.end_prepare(data("g", 9), 0).unwrap();
        tp.forget("g");
        assert!(tp.is_empty());
        assert!(tp.read_state_files().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tp = TwoPhaseState::new(4, Some(dir.path())).unwrap();
        tp.mark_as_preparing("g", Xid(9), Oid(1), Oid(10), BackendId(0))
            .unwrap();
        tp.end_prepare(data("g", 9), 0).unwrap();
        let path = dir.path().join("twophase").join("00000009");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();
        let err = tp.read_state_files().unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }
}
