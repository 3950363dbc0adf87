//! Batches group puts and deletes into a single atomic write.
//!
//! Committing a batch goes like this:
//!
//! 1. Encode every entry. Large records are appended to the value log.
//! 2. Take the commit lock of every partition the batch touches, in sorted order.
//! 3. Append the whole batch to the record log as one frame.
//! 4. Publish new versions of the touched partitions and release the locks.
//!
//! Nothing touches the index until the frame is on disk, and the frame is either entirely
//! there or dropped on recovery, so a batch is never half-applied. Holding the commit locks
//! across the append means two batches touching the same topic land in the log in the same
//! order they land in the index, which keeps replay faithful. Readers never take a commit lock,
//! so a slow disk only holds up other writers to the same topics.

use crate::{
    entry::{self, Entry, Timestamp},
    error::{Error, Result},
    index::{IndexKey, IndexStore, Locator, PartitionKey},
    log::{LogOp, RecordLog},
    MAX_TTL_SECS,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::path::Path;
use tracing::{debug, trace};

/// An operation queued in a [`Batch`].
#[derive(Debug)]
pub(crate) enum Op {
    Put(Entry),
    Delete(IndexKey),
    /// Delete the key, but only if it's still expired at the given time once we hold its lock.
    Expire(IndexKey, Timestamp),
}

impl Op {
    fn partition_key(&self) -> PartitionKey {
        match self {
            Self::Put(entry) => (entry.contract, entry.topic.clone()),
            Self::Delete(key) | Self::Expire(key, _) => key.partition_key(),
        }
    }
}

/// Owns the index and the logs, and is the only thing that writes to either.
#[derive(Debug)]
pub struct BatchWriter {
    index: IndexStore,
    log: RecordLog,
    value_threshold: usize,
    /// Commits hold this shared. Compaction holds it exclusively so it sees (and writes) a
    /// stable index.
    gate: RwLock<()>,
}

impl BatchWriter {
    /// Open the logs and replay them into a fresh index.
    pub(crate) fn open(dir: &Path, value_dir: &Path, value_threshold: usize, sync_writes: bool) -> Result<Self> {
        let log = RecordLog::open(dir, value_dir, sync_writes)?;
        let index = IndexStore::new();
        log.load(|ops| {
            for op in ops {
                let key = op.key().clone();
                match op.index_entry() {
                    Some(entry) => index.put(key, entry),
                    None => { index.delete(&key); }
                }
            }
            Ok(())
        })?;
        Ok(Self {
            index,
            log,
            value_threshold,
            gate: RwLock::new(()),
        })
    }

    /// Get at the index
    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Start a new batch against this writer.
    pub fn begin(&self) -> Batch<&Self> {
        Batch::new(self)
    }

    /// Load and decode the record a locator points at.
    pub fn read_entry(&self, locator: &Locator) -> Result<Entry> {
        match locator {
            Locator::Inline(record) => entry::decode(record),
            Locator::Value { offset, len } => entry::decode(&self.log.values().read(*offset, *len)?),
        }
    }

    /// Encode a put into the log op that will persist it. Expiries further out than the TTL
    /// ceiling are pulled in to it.
    fn prepare_put(&self, mut entry: Entry, now: Timestamp) -> Result<LogOp> {
        let ceiling = now.add_secs(MAX_TTL_SECS);
        entry.expiry = entry.expiry.map(|exp| exp.min(ceiling));
        let record = entry::encode(&entry)?;
        let key = IndexKey::new(entry.contract, entry.topic.clone(), entry.id.clone());
        if record.len() >= self.value_threshold {
            let (offset, len) = self.log.values().append(&record, self.log.sync_writes())?;
            Ok(LogOp::PutValue { key, expires_at: entry.expiry, offset, len })
        } else {
            Ok(LogOp::Put { key, expires_at: entry.expiry, record })
        }
    }

    /// Atomically apply a set of operations.
    #[tracing::instrument(skip(self, ops), fields(ops = ops.len()))]
    pub(crate) fn commit(&self, ops: Vec<Op>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let _gate = self.gate.read();
        let now = Timestamp::now();

        let mut prepared = Vec::with_capacity(ops.len());
        for op in ops {
            let partition = op.partition_key();
            let log_op = match op {
                Op::Put(entry) => Some(self.prepare_put(entry, now)?),
                Op::Delete(key) => Some(LogOp::Delete { key }),
                Op::Expire(key, at) => {
                    prepared.push((partition, None, Some((key, at))));
                    continue;
                }
            };
            prepared.push((partition, log_op, None));
        }

        // BTreeMap gives us the sorted lock order that keeps concurrent commits from
        // deadlocking each other
        let partitions = prepared.iter()
            .map(|(part, _, _)| (part.clone(), self.index.partition(part)))
            .collect::<BTreeMap<_, _>>();
        let _commits = partitions.values()
            .map(|part| part.lock_commits())
            .collect::<Vec<_>>();

        let mut log_ops = Vec::with_capacity(prepared.len());
        for (partition, log_op, expire) in prepared {
            match (log_op, expire) {
                (Some(log_op), _) => log_ops.push((partition, log_op)),
                (None, Some((key, at))) => {
                    // nobody else can change this partition while we hold its commit lock
                    let still_expired = partitions.get(&partition)
                        .and_then(|part| part.version().get(key.id()).and_then(|entry| entry.expires_at()))
                        .map(|exp| exp <= at)
                        .unwrap_or(false);
                    if still_expired {
                        log_ops.push((partition, LogOp::Delete { key }));
                    }
                }
                (None, None) => {}
            }
        }
        if log_ops.is_empty() {
            trace!("BatchWriter::commit() -- nothing left to write");
            return Ok(());
        }

        let just_ops = log_ops.iter().map(|(_, op)| op.clone()).collect::<Vec<_>>();
        self.log.append(&just_ops)?;

        // publish every touched partition at once so no reader sees part of the batch
        let mut maps = partitions.iter()
            .map(|(key, part)| (key.clone(), part.begin_publish()))
            .collect::<BTreeMap<PartitionKey, RwLockWriteGuard<'_, _>>>();
        for (partition, op) in log_ops {
            let map = match maps.get_mut(&partition) {
                Some(map) => Arc::make_mut(&mut **map),
                None => continue,
            };
            let id = op.key().id().clone();
            match op.index_entry() {
                Some(entry) => { map.insert(id, entry); }
                None => { map.remove(&id); }
            }
        }
        drop(maps);
        trace!("BatchWriter::commit() -- committed {} ops", just_ops.len());
        Ok(())
    }

    /// Rewrite the record log so it only holds what's currently in the index. Returns how many
    /// entries were written.
    pub(crate) fn compact(&self) -> Result<usize> {
        let _gate = self.gate.write();
        let snapshot = self.index.snapshot();
        let count = snapshot.iter().map(|x| x.len()).sum();
        // one frame per partition keeps frames a sane size
        let batches = snapshot.into_iter()
            .map(|entries| {
                entries.into_iter()
                    .map(|(key, entry)| LogOp::from_index(key, &entry))
                    .collect::<Vec<_>>()
            });
        self.log.rewrite(batches)?;
        // TODO: the value log is never compacted. records orphaned by deletes/overwrites stay
        // on disk until we copy live values into a fresh value log here as well.
        debug!("BatchWriter::compact() -- rewrote log with {} entries", count);
        Ok(count)
    }

    /// Flush the logs to disk.
    pub(crate) fn sync(&self) -> Result<()> {
        self.log.sync()
    }
}

/// A set of operations that are applied all together or not at all.
///
/// The batch is generic over how it holds its [`BatchWriter`]: a plain reference, or (when it
/// comes from [`Engine::begin`][crate::engine::Engine::begin]) a guard that keeps the engine
/// from closing while the batch is alive.
#[derive(Debug)]
pub struct Batch<W: Deref<Target = BatchWriter>> {
    writer: W,
    ops: Vec<Op>,
    closed: bool,
}

impl<W: Deref<Target = BatchWriter>> Batch<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer,
            ops: Vec::new(),
            closed: false,
        }
    }

    fn push(&mut self, op: Op) -> Result<()> {
        if self.closed {
            return Err(Error::BatchClosed);
        }
        self.ops.push(op);
        Ok(())
    }

    /// Queue an entry to be written. The entry is stored under its own id, overwriting anything
    /// already there.
    pub fn put_entry(&mut self, entry: Entry) -> Result<()> {
        self.push(Op::Put(entry))
    }

    /// Queue a key to be deleted. Deleting a key that doesn't exist is fine.
    pub fn delete_entry(&mut self, key: IndexKey) -> Result<()> {
        self.push(Op::Delete(key))
    }

    pub(crate) fn expire_entry(&mut self, key: IndexKey, now: Timestamp) -> Result<()> {
        self.push(Op::Expire(key, now))
    }

    /// How many operations are queued
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch has nothing queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply everything queued. The batch is closed afterwards, whether or not the commit worked.
    pub fn commit(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::BatchClosed);
        }
        self.closed = true;
        let ops = std::mem::take(&mut self.ops);
        self.writer.commit(ops)
    }
}
