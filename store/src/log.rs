//! On-disk persistence: the record log and the value log.
//!
//! The record log is the source of truth. It starts with a small header and then holds one
//! frame per committed batch:
//!
//! ```text
//! [len: u32][crc32: u32][payload: len bytes]
//! ```
//!
//! where the payload is the batch's list of [`LogOp`]s. On open the frames are replayed in
//! order to rebuild the index. If the last frame is short or fails its checksum (we crashed
//! while writing it), replay stops there and the file is cut back to the end of the last good
//! frame, which drops the interrupted batch as a whole.
//!
//! The value log holds records too big to keep in memory. They're appended (with their own
//! checksum) before the frame that references them, so a frame never points at data that isn't
//! there yet. A crash between the two leaves some unreferenced bytes in the value log and
//! nothing else.

use crate::{
    entry::Timestamp,
    error::{Error, Result},
    index::{IndexEntry, IndexKey, Locator},
    ser,
};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) const LOG_FILE: &str = "tidepool.log";
pub(crate) const VALUE_FILE: &str = "tidepool.vlog";
const LOG_MAGIC: &[u8; 8] = b"TDPLLOG1";
const VALUE_MAGIC: &[u8; 8] = b"TDPLVAL1";
const HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: usize = 8;

/// A single persisted modification. A batch is written as a list of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum LogOp {
    /// Store a record inline
    Put { key: IndexKey, expires_at: Option<Timestamp>, record: Vec<u8> },
    /// Store a pointer to a record in the value log
    PutValue { key: IndexKey, expires_at: Option<Timestamp>, offset: u64, len: u32 },
    /// Remove a key
    Delete { key: IndexKey },
}

impl LogOp {
    pub(crate) fn key(&self) -> &IndexKey {
        match self {
            Self::Put { key, .. } | Self::PutValue { key, .. } | Self::Delete { key } => key,
        }
    }

    /// What applying this op leaves in the index: an entry for puts, nothing for deletes.
    pub(crate) fn index_entry(&self) -> Option<IndexEntry> {
        match self {
            Self::Put { expires_at, record, .. } => {
                Some(IndexEntry::new(Locator::Inline(Arc::from(record.as_slice())), *expires_at))
            }
            Self::PutValue { expires_at, offset, len, .. } => {
                Some(IndexEntry::new(Locator::Value { offset: *offset, len: *len }, *expires_at))
            }
            Self::Delete { .. } => None,
        }
    }

    /// Turn an index entry back into the op that would recreate it.
    pub(crate) fn from_index(key: IndexKey, entry: &IndexEntry) -> Self {
        match entry.locator() {
            Locator::Inline(record) => Self::Put { key, expires_at: entry.expires_at(), record: record.to_vec() },
            Locator::Value { offset, len } => Self::PutValue { key, expires_at: entry.expires_at(), offset: *offset, len: *len },
        }
    }
}

/// Open (or create) a file and check its magic header.
fn open_with_header(path: &Path, magic: &[u8; 8]) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| Error::unavailable(format!("open {}: {}", path.display(), e)))?;
    let len = file.metadata()
        .map_err(|e| Error::unavailable(format!("stat {}: {}", path.display(), e)))?
        .len();
    if len == 0 {
        file.write_all(magic)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::unavailable(format!("write header {}: {}", path.display(), e)))?;
    } else {
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| Error::unavailable(format!("read header {}: {}", path.display(), e)))?;
        if &header != magic {
            return Err(Error::unavailable(format!("{} has a bad header", path.display())));
        }
    }
    Ok(file)
}

/// The size of a framed payload, which has to fit in the `u32` a value locator records.
fn framed_len(payload_len: usize) -> Result<u32> {
    payload_len.checked_add(FRAME_HEADER_LEN)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| Error::write_conflict(format!("record too large to frame ({} bytes)", payload_len)))
}

fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = framed_len(payload.len())? - FRAME_HEADER_LEN as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Debug)]
struct Appender {
    file: File,
    /// Where the next write lands
    end: u64,
}

impl Appender {
    /// Write a buffer at the end of the file. If the write fails partway, the file is cut
    /// back so the partial write can't be mistaken for data later.
    fn append(&mut self, buf: &[u8], sync: bool) -> std::io::Result<u64> {
        let start = self.end;
        let res = self.file.seek(SeekFrom::Start(start))
            .and_then(|_| self.file.write_all(buf))
            .and_then(|_| if sync { self.file.sync_data() } else { Ok(()) });
        match res {
            Ok(_) => {
                self.end = start + buf.len() as u64;
                Ok(start)
            }
            Err(e) => {
                if let Err(e2) = self.file.set_len(start) {
                    warn!("Appender::append() -- failed to truncate after write error: {}", e2);
                }
                Err(e)
            }
        }
    }
}

/// The value log, where large records go.
#[derive(Debug)]
pub(crate) struct ValueLog {
    path: PathBuf,
    inner: Mutex<Appender>,
}

impl ValueLog {
    fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(VALUE_FILE);
        let mut file = open_with_header(&path, VALUE_MAGIC)?;
        let end = file.seek(SeekFrom::End(0))
            .map_err(|e| Error::unavailable(format!("seek {}: {}", path.display(), e)))?;
        Ok(Self { path, inner: Mutex::new(Appender { file, end }) })
    }

    /// Append a record, returning its (offset, len) for use in a [`Locator::Value`].
    pub(crate) fn append(&self, record: &[u8], sync: bool) -> Result<(u64, u32)> {
        let len = framed_len(record.len())?;
        let framed = frame(record)?;
        let offset = self.inner.lock().append(&framed, sync)
            .map_err(|e| Error::write_conflict(format!("append {}: {}", self.path.display(), e)))?;
        Ok((offset, len))
    }

    /// Read a record back out.
    pub(crate) fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        {
            let mut guard = self.inner.lock();
            if offset.saturating_add(len as u64) > guard.end {
                return Err(Error::CorruptRecord(format!("value at {}+{} is past the end of the value log", offset, len)));
            }
            guard.file.seek(SeekFrom::Start(offset))
                .and_then(|_| guard.file.read_exact(&mut buf))?;
        }
        match unframe(&buf)? {
            Some((payload, used)) if used == buf.len() => Ok(Vec::from(payload)),
            _ => Err(Error::CorruptRecord(format!("value at {}+{} failed its checksum", offset, len))),
        }
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

/// Try to pull one frame off the front of `buf`. `Ok(None)` means the frame is incomplete or
/// its checksum doesn't match.
fn unframe(buf: &[u8]) -> Result<Option<(&[u8], usize)>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut len = [0u8; 4];
    let mut crc = [0u8; 4];
    len.copy_from_slice(&buf[0..4]);
    crc.copy_from_slice(&buf[4..8]);
    let len = u32::from_be_bytes(len) as usize;
    let end = FRAME_HEADER_LEN + len;
    if buf.len() < end {
        return Ok(None);
    }
    let payload = &buf[FRAME_HEADER_LEN..end];
    if crc32fast::hash(payload) != u32::from_be_bytes(crc) {
        return Ok(None);
    }
    Ok(Some((payload, end)))
}

/// The record log (and the value log hanging off of it).
#[derive(Debug)]
pub(crate) struct RecordLog {
    path: PathBuf,
    inner: Mutex<Appender>,
    values: ValueLog,
    sync_writes: bool,
}

impl RecordLog {
    /// Open the record log in `dir` and the value log in `value_dir`, creating either if
    /// needed. Call [`load`][RecordLog::load] afterwards to replay what's in there.
    pub(crate) fn open(dir: &Path, value_dir: &Path, sync_writes: bool) -> Result<Self> {
        let path = dir.join(LOG_FILE);
        let file = open_with_header(&path, LOG_MAGIC)?;
        let values = ValueLog::open(value_dir)?;
        Ok(Self {
            path,
            inner: Mutex::new(Appender { file, end: HEADER_LEN }),
            values,
            sync_writes,
        })
    }

    /// Replay every intact frame through `loader`, in order. Anything after the last intact
    /// frame is truncated away.
    pub(crate) fn load<F>(&self, mut loader: F) -> Result<usize>
        where F: FnMut(Vec<LogOp>) -> Result<()>
    {
        let mut guard = self.inner.lock();
        let mut contents = Vec::new();
        guard.file.seek(SeekFrom::Start(0))
            .and_then(|_| guard.file.read_to_end(&mut contents))
            .map_err(|e| Error::unavailable(format!("read {}: {}", self.path.display(), e)))?;

        let mut pos = HEADER_LEN as usize;
        let mut frames = 0;
        while pos < contents.len() {
            let (payload, used) = match unframe(&contents[pos..])? {
                Some(x) => x,
                None => break,
            };
            let ops = match ser::deserialize::<Vec<LogOp>>(payload) {
                Ok(ops) => ops,
                Err(e) => {
                    warn!("RecordLog::load() -- frame at {} passed its checksum but won't deserialize: {}", pos, e);
                    break;
                }
            };
            loader(ops)?;
            pos += used;
            frames += 1;
        }

        if pos < contents.len() {
            warn!(
                "RecordLog::load() -- discarding {} bytes of incomplete/corrupt log after offset {} in {}",
                contents.len() - pos, pos, self.path.display()
            );
            guard.file.set_len(pos as u64)
                .and_then(|_| guard.file.sync_all())
                .map_err(|e| Error::unavailable(format!("truncate {}: {}", self.path.display(), e)))?;
        }
        guard.end = pos as u64;
        info!("RecordLog::load() -- replayed {} batches from {}", frames, self.path.display());
        Ok(frames)
    }

    /// Write a batch's ops as one frame.
    pub(crate) fn append(&self, ops: &[LogOp]) -> Result<()> {
        let payload = ser::serialize(&ops)?;
        let framed = frame(&payload)?;
        self.inner.lock().append(&framed, self.sync_writes)
            .map_err(|e| Error::write_conflict(format!("append {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    /// Replace the log with one containing exactly the given batches. The new log is written
    /// beside the old one and renamed over it, so a crash here leaves one or the other intact.
    pub(crate) fn rewrite<I>(&self, batches: I) -> Result<()>
        where I: IntoIterator<Item = Vec<LogOp>>
    {
        let tmp_path = self.path.with_extension("log.compact");
        let mut guard = self.inner.lock();
        // this handle becomes the live log once renamed, so there's no reopen to fail afterwards
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(LOG_MAGIC)?;
        let mut end = HEADER_LEN;
        for ops in batches {
            let framed = frame(&ser::serialize(&ops)?)?;
            tmp.write_all(&framed)?;
            end += framed.len() as u64;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            // make the rename itself durable. not every platform lets you open a directory,
            // so failing here isn't fatal.
            if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
                debug!("RecordLog::rewrite() -- couldn't sync {}: {}", dir.display(), e);
            }
        }
        *guard = Appender { file: tmp, end };
        Ok(())
    }

    /// Get at the value log
    pub(crate) fn values(&self) -> &ValueLog {
        &self.values
    }

    /// Whether every commit is fsynced
    pub(crate) fn sync_writes(&self) -> bool {
        self.sync_writes
    }

    /// Flush everything to disk.
    pub(crate) fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        self.values.sync()
    }

    /// Swap the record log's handle for a read-only one so every append fails.
    #[cfg(test)]
    pub(crate) fn make_read_only(&self) -> Result<()> {
        let file = File::open(&self.path)?;
        let mut guard = self.inner.lock();
        guard.file = file;
        Ok(())
    }
}
