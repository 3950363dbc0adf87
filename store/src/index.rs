//! The index maps `(contract, topic, id)` to wherever that message's record lives.
//!
//! Each (contract, topic) pair gets its own partition: an ordered map from id to
//! [`IndexEntry`]. Since generated ids sort by time, the newest messages are always at the end
//! of a partition and a "most recent N" query is a reverse walk of at most N items. Partitions
//! never see each other's keys, so one tenant's topic can't leak into another's query.
//!
//! A partition's map is copy-on-write. Readers grab the current version (an `Arc` clone under
//! a lock held for no longer than that) and walk it with no lock at all. Writers serialize on
//! the partition's commit lock, do their I/O, and only then swap in the new version, so the
//! map's lock is never held across disk access.

use ahash::RandomState;
use crate::{
    entry::{Contract, MessageId, Timestamp},
};
use dashmap::DashMap;
use getset::{CopyGetters, Getters};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// The full address of a stored message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Getters, CopyGetters, Serialize, Deserialize)]
pub struct IndexKey {
    #[getset(get_copy = "pub")]
    contract: Contract,
    #[getset(get = "pub")]
    topic: Vec<u8>,
    #[getset(get = "pub")]
    id: MessageId,
}

impl IndexKey {
    /// Create a new index key
    pub fn new<C, T, I>(contract: C, topic: T, id: I) -> Self
        where C: Into<Contract>,
              T: Into<Vec<u8>>,
              I: Into<MessageId>,
    {
        Self {
            contract: contract.into(),
            topic: topic.into(),
            id: id.into(),
        }
    }

    /// The partition this key lives in
    pub(crate) fn partition_key(&self) -> PartitionKey {
        (self.contract, self.topic.clone())
    }
}

/// Points at a message's encoded record.
#[derive(Clone, Debug, PartialEq)]
pub enum Locator {
    /// The record is held in memory
    Inline(Arc<[u8]>),
    /// The record lives in the value log at this offset
    Value { offset: u64, len: u32 },
}

/// What the index stores for each key.
#[derive(Clone, Debug, PartialEq, Getters, CopyGetters)]
pub struct IndexEntry {
    #[getset(get = "pub")]
    locator: Locator,
    /// Copied out of the record so expiry checks don't need a decode
    #[getset(get_copy = "pub")]
    expires_at: Option<Timestamp>,
}

impl IndexEntry {
    pub fn new(locator: Locator, expires_at: Option<Timestamp>) -> Self {
        Self { locator, expires_at }
    }

    fn is_live(&self, now: Option<Timestamp>) -> bool {
        match (self.expires_at, now) {
            (Some(exp), Some(now)) => exp > now,
            _ => true,
        }
    }
}

pub(crate) type PartitionKey = (Contract, Vec<u8>);
pub(crate) type PartitionMap = BTreeMap<MessageId, IndexEntry>;

/// One (contract, topic)'s slice of the index.
#[derive(Debug, Default)]
pub(crate) struct Partition {
    /// Held by a commit from before its log write until its changes are published
    commit: Mutex<()>,
    current: RwLock<Arc<PartitionMap>>,
}

impl Partition {
    /// Serialize against other commits touching this partition.
    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit.lock()
    }

    /// The current version of the map. Later writes don't show up in it.
    pub(crate) fn version(&self) -> Arc<PartitionMap> {
        self.current.read().clone()
    }

    /// Lock the map for publishing a new version. Readers wait on this, so it should only be
    /// held while changing the map in memory.
    pub(crate) fn begin_publish(&self) -> RwLockWriteGuard<'_, Arc<PartitionMap>> {
        self.current.write()
    }

    /// Apply changes to the map. The map is only copied if a reader still holds the version
    /// being replaced.
    pub(crate) fn update<F, T>(&self, f: F) -> T
        where F: FnOnce(&mut PartitionMap) -> T
    {
        let mut guard = self.begin_publish();
        f(Arc::make_mut(&mut *guard))
    }
}

/// The results of a [`IndexStore::range_scan`], newest first.
///
/// The scan walks a single version of the partition, so it's a consistent snapshot: a batch is
/// either entirely in it or entirely out of it. Re-running the scan
/// starts over from whatever the newest entry is at that point.
#[derive(Debug)]
pub struct RangeScan {
    items: std::vec::IntoIter<(MessageId, IndexEntry)>,
}

impl Iterator for RangeScan {
    type Item = (MessageId, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for RangeScan {}

/// Our ordered index of every message in the store.
#[derive(Debug, Default)]
pub struct IndexStore {
    partitions: DashMap<PartitionKey, Arc<Partition>, RandomState>,
}

impl IndexStore {
    /// Create a new, empty index.
    pub fn new() -> Self {
        Self {
            partitions: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Get a handle on a (contract, topic)'s partition, creating it if needed.
    pub(crate) fn partition(&self, key: &PartitionKey) -> Arc<Partition> {
        if let Some(part) = self.partitions.get(key) {
            return part.value().clone();
        }
        self.partitions.entry(key.clone())
            .or_insert_with(Default::default)
            .value()
            .clone()
    }

    fn existing_partition(&self, contract: Contract, topic: &[u8]) -> Option<Arc<Partition>> {
        // the tuple key owns its topic, so we have to build one to look it up
        self.partitions.get(&(contract, Vec::from(topic)))
            .map(|x| x.value().clone())
    }

    /// Insert or overwrite a key.
    pub fn put(&self, key: IndexKey, entry: IndexEntry) {
        let part = self.partition(&key.partition_key());
        let IndexKey { id, .. } = key;
        part.update(|map| map.insert(id, entry));
    }

    /// Remove a key, returning whether it was there.
    pub fn delete(&self, key: &IndexKey) -> bool {
        match self.existing_partition(key.contract, &key.topic) {
            Some(part) => part.update(|map| map.remove(&key.id).is_some()),
            None => false,
        }
    }

    /// Look up a single key.
    pub fn get(&self, key: &IndexKey) -> Option<IndexEntry> {
        self.existing_partition(key.contract, &key.topic)
            .and_then(|part| part.version().get(&key.id).cloned())
    }

    /// Return up to `limit` of the newest entries in a (contract, topic), newest first.
    pub fn range_scan<C: Into<Contract>>(&self, contract: C, topic: &[u8], limit: usize) -> RangeScan {
        self.scan(contract.into(), topic, limit, None)
    }

    /// Like [`range_scan`][IndexStore::range_scan], but skips anything expired as of `now`.
    /// Skipped entries don't count toward `limit`.
    pub fn range_scan_live<C: Into<Contract>>(&self, contract: C, topic: &[u8], limit: usize, now: Timestamp) -> RangeScan {
        self.scan(contract.into(), topic, limit, Some(now))
    }

    fn scan(&self, contract: Contract, topic: &[u8], limit: usize, now: Option<Timestamp>) -> RangeScan {
        let items = match self.existing_partition(contract, topic) {
            Some(part) => {
                let map = part.version();
                map.iter()
                    .rev()
                    .filter(|(_, entry)| entry.is_live(now))
                    .take(limit)
                    .map(|(id, entry)| (id.clone(), entry.clone()))
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        trace!("IndexStore::scan() -- contract {} found {} (limit {})", contract, items.len(), limit);
        RangeScan { items: items.into_iter() }
    }

    /// Find every key that's expired as of `now`.
    pub fn expired(&self, now: Timestamp) -> Vec<IndexKey> {
        let mut keys = Vec::new();
        for part in self.partitions.iter() {
            let (contract, topic) = part.key();
            let map = part.value().version();
            for (id, entry) in map.iter() {
                if !entry.is_live(Some(now)) {
                    keys.push(IndexKey::new(*contract, topic.clone(), id.clone()));
                }
            }
        }
        keys
    }

    /// Copy out every key and entry in the index, partition by partition.
    pub(crate) fn snapshot(&self) -> Vec<Vec<(IndexKey, IndexEntry)>> {
        self.partitions.iter()
            .map(|part| {
                let (contract, topic) = part.key();
                part.value().version().iter()
                    .map(|(id, entry)| (IndexKey::new(*contract, topic.clone(), id.clone()), entry.clone()))
                    .collect::<Vec<_>>()
            })
            .filter(|entries| !entries.is_empty())
            .collect()
    }

    /// How many entries are in the index
    pub fn len(&self) -> usize {
        self.partitions.iter()
            .map(|part| part.value().version().len())
            .sum()
    }

    /// Whether the index holds nothing at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(val: &str) -> IndexEntry {
        IndexEntry::new(Locator::Inline(Arc::from(val.as_bytes())), None)
    }

    fn ids(scan: RangeScan) -> Vec<Vec<u8>> {
        scan.map(|(id, _)| Vec::from(id)).collect()
    }

    #[test]
    fn put_scan_descending() {
        let index = IndexStore::new();
        for id in [3u8, 1, 5, 2, 4] {
            index.put(IndexKey::new(1u32, "a", vec![id]), inline("x"));
        }
        assert_eq!(ids(index.range_scan(1u32, b"a", 10)), vec![vec![5], vec![4], vec![3], vec![2], vec![1]]);
        assert_eq!(ids(index.range_scan(1u32, b"a", 2)), vec![vec![5], vec![4]]);
        assert_eq!(ids(index.range_scan(1u32, b"a", 0)), Vec::<Vec<u8>>::new());
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn partitions_are_isolated() {
        let index = IndexStore::new();
        index.put(IndexKey::new(1u32, "a", vec![1u8]), inline("1a"));
        index.put(IndexKey::new(2u32, "a", vec![2u8]), inline("2a"));
        index.put(IndexKey::new(1u32, "ab", vec![3u8]), inline("1ab"));
        index.put(IndexKey::new(1u32, "", vec![4u8]), inline("1"));
        assert_eq!(ids(index.range_scan(1u32, b"a", 10)), vec![vec![1]]);
        assert_eq!(ids(index.range_scan(2u32, b"a", 10)), vec![vec![2]]);
        assert_eq!(ids(index.range_scan(1u32, b"ab", 10)), vec![vec![3]]);
        assert_eq!(ids(index.range_scan(1u32, b"", 10)), vec![vec![4]]);
        assert_eq!(ids(index.range_scan(3u32, b"a", 10)), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn overwrite_and_delete() {
        let index = IndexStore::new();
        let key = IndexKey::new(1u32, "a", vec![1u8]);
        index.put(key.clone(), inline("old"));
        index.put(key.clone(), inline("new"));
        assert_eq!(index.get(&key), Some(inline("new")));
        assert_eq!(index.len(), 1);
        assert!(index.delete(&key));
        assert!(!index.delete(&key));
        assert!(!index.delete(&IndexKey::new(9u32, "nope", vec![1u8])));
        assert!(index.is_empty());
        assert_eq!(index.get(&key), None);
    }

    #[test]
    fn scan_skips_expired() {
        let index = IndexStore::new();
        index.put(IndexKey::new(1u32, "a", vec![1u8]), inline("keep"));
        index.put(IndexKey::new(1u32, "a", vec![2u8]), IndexEntry::new(Locator::Inline(Arc::from(&b"old"[..])), Some(Timestamp::from(100i64))));
        index.put(IndexKey::new(1u32, "a", vec![3u8]), IndexEntry::new(Locator::Inline(Arc::from(&b"fresh"[..])), Some(Timestamp::from(500i64))));
        let now = Timestamp::from(200i64);
        assert_eq!(ids(index.range_scan_live(1u32, b"a", 10, now)), vec![vec![3], vec![1]]);
        assert_eq!(ids(index.range_scan_live(1u32, b"a", 2, now)), vec![vec![3], vec![1]]);
        assert_eq!(ids(index.range_scan(1u32, b"a", 10)), vec![vec![3], vec![2], vec![1]]);
        assert_eq!(index.expired(now), vec![IndexKey::new(1u32, "a", vec![2u8])]);
    }

    #[test]
    fn scan_is_restartable() {
        let index = IndexStore::new();
        index.put(IndexKey::new(1u32, "a", vec![1u8]), inline("x"));
        let scan = index.range_scan(1u32, b"a", 10);
        index.put(IndexKey::new(1u32, "a", vec![2u8]), inline("y"));
        // the first scan is a snapshot...
        assert_eq!(ids(scan), vec![vec![1]]);
        // ...and a new one picks up the latest
        assert_eq!(ids(index.range_scan(1u32, b"a", 10)), vec![vec![2], vec![1]]);
    }

    #[test]
    fn reads_skip_the_commit_lock() {
        let index = Arc::new(IndexStore::new());
        let key = IndexKey::new(1u32, "a", vec![1u8]);
        index.put(key.clone(), inline("x"));
        let (locked_tx, locked_rx) = crossbeam_channel::bounded::<()>(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let committer = {
            let index = index.clone();
            let part_key = key.partition_key();
            std::thread::spawn(move || {
                let part = index.partition(&part_key);
                let _commit = part.lock_commits();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        locked_rx.recv().unwrap();
        // a commit is "mid-write" on this partition, reads carry on regardless
        assert_eq!(ids(index.range_scan(1u32, b"a", 10)), vec![vec![1]]);
        assert_eq!(index.get(&key), Some(inline("x")));
        assert_eq!(index.expired(Timestamp::from(0i64)), Vec::<IndexKey>::new());
        release_tx.send(()).unwrap();
        committer.join().unwrap();
    }

    #[test]
    fn held_versions_dont_change() {
        let index = IndexStore::new();
        let key = IndexKey::new(1u32, "a", vec![1u8]);
        index.put(key.clone(), inline("x"));
        let part = index.partition(&key.partition_key());
        let before = part.version();
        index.put(IndexKey::new(1u32, "a", vec![2u8]), inline("y"));
        index.delete(&key);
        assert_eq!(before.len(), 1);
        assert!(before.contains_key(key.id()));
        assert_eq!(part.version().len(), 1);
        assert!(!part.version().contains_key(key.id()));
    }
}
