//! Durable append-only log.
//!
//! On-disk layout:
//! ```text
//! [magic "MRDN"][version u32]            file header, 8 bytes
//! [len u32][crc32 u32][payload; len]     one frame per record
//! ```
//! A record's [`Lsn`] is the byte offset of its frame. The first record is
//! at `Lsn(8)` in both the file-backed and in-memory logs, so `Lsn(0)` is
//! never a valid record position.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use meridian_common::config::SyncMode;
use meridian_common::error::WalError;
use meridian_common::types::{Lsn, Xid};
use parking_lot::Mutex;

pub const XLOG_MAGIC: &[u8; 4] = b"MRDN";
pub const XLOG_FORMAT_VERSION: u32 = 1;
pub const XLOG_HEADER_SIZE: u64 = 8;
const FRAME_HEADER_SIZE: u64 = 8;

/// Largest payload accepted by `append`; larger length words are treated as
/// corruption when reading.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// The durable log facility used by commit/abort recording and redo.
pub trait DurableLog: Send + Sync {
    /// Append one record; returns its position. Not durable until `flush`.
    fn append(&self, payload: &[u8]) -> Result<Lsn, WalError>;

    /// Make every record up to and including the one at `upto` durable.
    fn flush(&self, upto: Lsn) -> Result<(), WalError>;

    /// End of the durable prefix.
    fn flushed_lsn(&self) -> Lsn;

    /// Position the next `append` will return.
    fn end_lsn(&self) -> Lsn;

    /// Read the record at `lsn`. Returns the payload and the position of the
    /// following record, or `None` at the end of the log.
    fn read_at(&self, lsn: Lsn) -> Result<Option<(Vec<u8>, Lsn)>, WalError>;
}

fn frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf
}

/// Validate one frame starting at `data[0]`. Returns the payload slice.
fn unframe(data: &[u8], lsn: Lsn) -> Result<&[u8], WalError> {
    if data.len() < FRAME_HEADER_SIZE as usize {
        return Err(WalError::Truncated {
            expected: FRAME_HEADER_SIZE as usize,
            actual: data.len(),
        });
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if len > MAX_RECORD_SIZE {
        return Err(WalError::Corrupt {
            lsn,
            reason: format!("record length {} exceeds limit", len),
        });
    }
    let end = FRAME_HEADER_SIZE as usize + len;
    if data.len() < end {
        return Err(WalError::Truncated {
            expected: end,
            actual: data.len(),
        });
    }
    let payload = &data[FRAME_HEADER_SIZE as usize..end];
    if crc32fast::hash(payload) != crc {
        return Err(WalError::Corrupt {
            lsn,
            reason: "crc mismatch".into(),
        });
    }
    Ok(payload)
}

fn check_payload(payload: &[u8]) -> Result<(), WalError> {
    if payload.len() > MAX_RECORD_SIZE {
        return Err(WalError::Corrupt {
            lsn: Lsn::INVALID,
            reason: format!("refusing to append {} byte record", payload.len()),
        });
    }
    Ok(())
}

// ── File-backed log ──────────────────────────────────────────────────────────

struct FileLogInner {
    writer: BufWriter<File>,
}

/// Single-file durable log.
pub struct FileLog {
    path: PathBuf,
    inner: Mutex<FileLogInner>,
    end: AtomicU64,
    flushed: AtomicU64,
    sync_mode: SyncMode,
}

impl FileLog {
    pub const FILE_NAME: &'static str = "xlog.dat";

    /// Open (or create) the log under `dir`. A torn tail left by a crash is
    /// truncated back to the last intact record.
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<Self, WalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let end = if exists && file.metadata()?.len() > 0 {
            let valid_end = Self::scan_valid_end(&mut file)?;
            let len = file.metadata()?.len();
            if valid_end < len {
                tracing::warn!(
                    "xlog {}: truncating torn tail ({} bytes after {})",
                    path.display(),
                    len - valid_end,
                    Lsn(valid_end)
                );
                file.set_len(valid_end)?;
            }
            valid_end
        } else {
            file.write_all(XLOG_MAGIC)?;
            file.write_all(&XLOG_FORMAT_VERSION.to_le_bytes())?;
            file.sync_all()?;
            XLOG_HEADER_SIZE
        };

        tracing::debug!("xlog {} opened at {}", path.display(), Lsn(end));
        Ok(Self {
            path,
            inner: Mutex::new(FileLogInner {
                writer: BufWriter::new(file),
            }),
            end: AtomicU64::new(end),
            flushed: AtomicU64::new(end),
            sync_mode,
        })
    }

    fn scan_valid_end(file: &mut File) -> Result<u64, WalError> {
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        if data.len() < XLOG_HEADER_SIZE as usize || &data[0..4] != XLOG_MAGIC {
            return Err(WalError::Corrupt {
                lsn: Lsn::INVALID,
                reason: "bad xlog magic".into(),
            });
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != XLOG_FORMAT_VERSION {
            return Err(WalError::Corrupt {
                lsn: Lsn::INVALID,
                reason: format!("unsupported xlog version {}", version),
            });
        }
        let mut pos = XLOG_HEADER_SIZE as usize;
        while pos < data.len() {
            match unframe(&data[pos..], Lsn(pos as u64)) {
                Ok(payload) => pos += FRAME_HEADER_SIZE as usize + payload.len(),
                Err(_) => break,
            }
        }
        Ok(pos as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for FileLog {
    fn append(&self, payload: &[u8]) -> Result<Lsn, WalError> {
        check_payload(payload)?;
        let buf = frame(payload);
        let mut inner = self.inner.lock();
        inner.writer.write_all(&buf)?;
        let lsn = self.end.fetch_add(buf.len() as u64, Ordering::SeqCst);
        metrics::counter!("meridian_xlog_bytes_total").increment(buf.len() as u64);
        Ok(Lsn(lsn))
    }

    fn flush(&self, upto: Lsn) -> Result<(), WalError> {
        if upto.0 < self.flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        match self.sync_mode {
            SyncMode::None => {}
            SyncMode::FSync => inner.writer.get_ref().sync_all()?,
            SyncMode::FDataSync => inner.writer.get_ref().sync_data()?,
        }
        self.flushed
            .store(self.end.load(Ordering::SeqCst), Ordering::Release);
        metrics::counter!("meridian_xlog_flush_total").increment(1);
        Ok(())
    }

    fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed.load(Ordering::Acquire))
    }

    fn end_lsn(&self) -> Lsn {
        Lsn(self.end.load(Ordering::SeqCst))
    }

    fn read_at(&self, lsn: Lsn) -> Result<Option<(Vec<u8>, Lsn)>, WalError> {
        let end = {
            let mut inner = self.inner.lock();
            inner.writer.flush()?;
            self.end.load(Ordering::SeqCst)
        };
        if lsn.0 == end {
            return Ok(None);
        }
        if lsn.0 < XLOG_HEADER_SIZE || lsn.0 > end {
            return Err(WalError::OutOfRange(lsn));
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(lsn.0))?;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_RECORD_SIZE || lsn.0 + FRAME_HEADER_SIZE + len as u64 > end {
            return Err(WalError::Corrupt {
                lsn,
                reason: format!("record length {} runs past end of log", len),
            });
        }
        let mut data = Vec::with_capacity(FRAME_HEADER_SIZE as usize + len);
        data.extend_from_slice(&header);
        data.resize(FRAME_HEADER_SIZE as usize + len, 0);
        file.read_exact(&mut data[FRAME_HEADER_SIZE as usize..])?;
        let payload = unframe(&data, lsn)?.to_vec();
        Ok(Some((payload, Lsn(lsn.0 + FRAME_HEADER_SIZE + len as u64))))
    }
}

// ── In-memory log ────────────────────────────────────────────────────────────

/// Volatile log for tests and ephemeral nodes. `flush` only advances the
/// durable pointer.
pub struct MemLog {
    data: Mutex<Vec<u8>>,
    flushed: AtomicU64,
}

impl MemLog {
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(4096);
        data.extend_from_slice(XLOG_MAGIC);
        data.extend_from_slice(&XLOG_FORMAT_VERSION.to_le_bytes());
        Self {
            data: Mutex::new(data),
            flushed: AtomicU64::new(XLOG_HEADER_SIZE),
        }
    }

    /// Drop everything after the durable prefix, as a crash would.
    pub fn crash(&self) {
        let flushed = self.flushed.load(Ordering::Acquire) as usize;
        self.data.lock().truncate(flushed);
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableLog for MemLog {
    fn append(&self, payload: &[u8]) -> Result<Lsn, WalError> {
        check_payload(payload)?;
        let buf = frame(payload);
        let mut data = self.data.lock();
        let lsn = data.len() as u64;
        data.extend_from_slice(&buf);
        Ok(Lsn(lsn))
    }

    fn flush(&self, upto: Lsn) -> Result<(), WalError> {
        let data = self.data.lock();
        if upto.0 >= self.flushed.load(Ordering::Acquire) {
            self.flushed.store(data.len() as u64, Ordering::Release);
        }
        Ok(())
    }

    fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed.load(Ordering::Acquire))
    }

    fn end_lsn(&self) -> Lsn {
        Lsn(self.data.lock().len() as u64)
    }

    fn read_at(&self, lsn: Lsn) -> Result<Option<(Vec<u8>, Lsn)>, WalError> {
        let data = self.data.lock();
        let pos = lsn.0 as usize;
        if pos == data.len() {
            return Ok(None);
        }
        if lsn.0 < XLOG_HEADER_SIZE || pos > data.len() {
            return Err(WalError::OutOfRange(lsn));
        }
        let payload = unframe(&data[pos..], lsn)?;
        let next = Lsn(lsn.0 + FRAME_HEADER_SIZE + payload.len() as u64);
        Ok(Some((payload.to_vec(), next)))
    }
}

// ── Record envelope ──────────────────────────────────────────────────────────

/// Resource manager owning a record.
pub const RM_XACT_ID: u8 = 1;

/// One log record: resource manager, opcode byte, owning xid and the
/// manager-specific body.
///
/// Encoded as `[rmid u8][info u8][origin u16][xid u32][data...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlogRecord {
    pub rmid: u8,
    pub info: u8,
    /// Replication origin that produced the change (0 = local).
    pub origin: u16,
    pub xid: Xid,
    pub data: Bytes,
}

const ENVELOPE_SIZE: usize = 8;

impl XlogRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + self.data.len());
        buf.put_u8(self.rmid);
        buf.put_u8(self.info);
        buf.put_u16_le(self.origin);
        buf.put_u32_le(self.xid.0);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WalError> {
        if bytes.len() < ENVELOPE_SIZE {
            return Err(WalError::Truncated {
                expected: ENVELOPE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            rmid: bytes[0],
            info: bytes[1],
            origin: u16::from_le_bytes([bytes[2], bytes[3]]),
            xid: Xid(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
            data: Bytes::copy_from_slice(&bytes[ENVELOPE_SIZE..]),
        })
    }

    /// Append to `log`, returning the record position.
    pub fn insert(&self, log: &dyn DurableLog) -> Result<Lsn, WalError> {
        log.append(&self.encode())
    }
}

/// Read every record from `from` to the current end of `log`.
pub fn read_records(log: &dyn DurableLog, from: Lsn) -> Result<Vec<(Lsn, XlogRecord)>, WalError> {
    let mut out = Vec::new();
    let mut pos = if from.0 < XLOG_HEADER_SIZE {
        Lsn(XLOG_HEADER_SIZE)
    } else {
        from
    };
    while let Some((payload, next)) = log.read_at(pos)? {
        out.push((pos, XlogRecord::decode(&payload)?));
        pos = next;
    }
    Ok(out)
}
