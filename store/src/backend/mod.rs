//! The transactional byte-level backend: a single exclusive write batch
//! transaction and many concurrent read transactions over named buckets.
//! The backend is not itself MVCC-aware -- it provides durable ordered byte
//! storage plus atomic commit, and the store builds revision semantics on
//! top of it.

pub mod log;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{RwLock, RwLockWriteGuard};

use crate::error::{CResult, Error};
use self::log::Log;

/// The two logical buckets the store uses.
pub const BUCKET_KEY: &str = "key";
pub const BUCKET_META: &str = "meta";

/// `meta` bucket entry names.
pub const META_CONSISTENT_INDEX: &[u8] = b"consistent_index";
pub const META_SCHEDULED_COMPACT_REV: &[u8] = b"scheduledCompactRev";
pub const META_FINISHED_COMPACT_REV: &[u8] = b"finishedCompactRev";

/// A `(bucket, key)` pair identifying an entry to exclude from `Hash`.
pub type IgnoreKey = (&'static str, Vec<u8>);

/// `consistent_index` advances on writes the MVCC command stream never
/// issues directly (e.g. no-op Raft entries), so peers that otherwise
/// applied identical writes would otherwise disagree on its value.
pub fn default_ignores() -> HashSet<IgnoreKey> {
    let mut set = HashSet::new();
    set.insert((BUCKET_META, META_CONSISTENT_INDEX.to_vec()));
    set
}

struct Bucket {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    log: Option<Log>,
}

struct BackendInner {
    buckets: HashMap<&'static str, Bucket>,
}

/// The storage backend. Not `Clone` itself -- the store wraps it in an `Arc`
/// so a compaction sweep job can outlive the borrow of any single
/// transaction.
pub struct Backend {
    inner: RwLock<BackendInner>,
}

impl Backend {
    /// Opens a durable backend rooted at `dir`, creating it if absent and
    /// replaying each bucket's log to rebuild its in-memory contents.
    pub fn open(dir: PathBuf) -> CResult<Self> {
        let mut buckets = HashMap::new();
        for name in [BUCKET_KEY, BUCKET_META] {
            let mut log = Log::open(dir.join(format!("{}.log", name)))?;
            let data = log.replay()?;
            buckets.insert(name, Bucket { data, log: Some(log) });
        }
        Ok(Backend { inner: RwLock::new(BackendInner { buckets }) })
    }

    /// Opens a purely in-memory backend with no durability, for tests and
    /// embedding scenarios that don't need crash recovery.
    pub fn open_in_memory() -> Self {
        let mut buckets = HashMap::new();
        for name in [BUCKET_KEY, BUCKET_META] {
            buckets.insert(name, Bucket { data: BTreeMap::new(), log: None });
        }
        Backend { inner: RwLock::new(BackendInner { buckets }) }
    }

    /// Begins the single exclusive write batch transaction. Blocks until any
    /// other batch transaction or read transaction snapshot in progress
    /// releases the backend's internal lock.
    pub fn begin_batch(&self) -> BatchTx<'_> {
        let guard = self.inner.write().expect("backend lock poisoned");
        BatchTx { guard, locked: true }
    }

    /// Begins a read transaction: a point-in-time clone of every bucket.
    /// Cloning happens while holding the backend's read lock only long
    /// enough to copy the maps, so it never blocks on scan duration.
    pub fn begin_read(&self) -> ReadTx {
        let inner = self.inner.read().expect("backend lock poisoned");
        let buckets = inner.buckets.iter().map(|(name, b)| (*name, b.data.clone())).collect();
        ReadTx { buckets }
    }

    /// Force-commits the current batch (fsyncing durable buckets) and
    /// returns a digest over all entries except `ignore`. Bucket and key
    /// order is deterministic, so two backends that applied the same writes
    /// produce the same digest regardless of physical layout.
    pub fn hash(&self, ignore: &HashSet<IgnoreKey>) -> CResult<u64> {
        self.force_commit()?;
        let inner = self.inner.read().expect("backend lock poisoned");
        let mut hasher = std::collections::hash_map::DefaultHasher::new();

        let mut names: Vec<&&str> = inner.buckets.keys().collect();
        names.sort();
        for name in names {
            let bucket = &inner.buckets[name];
            name.hash(&mut hasher);
            for (k, v) in bucket.data.iter() {
                if ignore.contains(&(*name, k.clone())) {
                    continue;
                }
                k.hash(&mut hasher);
                v.hash(&mut hasher);
            }
        }
        Ok(hasher.finish())
    }

    /// Flushes and durably commits the current batch, then is ready for a
    /// fresh one. A no-op for in-memory buckets.
    pub fn force_commit(&self) -> CResult<()> {
        let inner = self.inner.read().expect("backend lock poisoned");
        for bucket in inner.buckets.values() {
            if let Some(log) = &bucket.log {
                log.force_sync()?;
            }
        }
        Ok(())
    }
}

/// The backend's single exclusive write transaction.
pub struct BatchTx<'a> {
    guard: RwLockWriteGuard<'a, BackendInner>,
    locked: bool,
}

impl<'a> BatchTx<'a> {
    /// Re-asserts exclusive access. The `RwLockWriteGuard` already grants
    /// exclusivity for the transaction's whole lifetime; this and `unlock`
    /// exist so the acquire/release protocol mandated by the backend
    /// contract stays visible at call sites instead of being implicit.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    fn bucket_mut(&mut self, name: &str) -> CResult<&mut Bucket> {
        assert!(self.locked, "UnsafePut/UnsafeDelete called without Lock()");
        self.guard
            .buckets
            .get_mut(name)
            .ok_or_else(|| Error::Internal(format!("unknown bucket {}", name)))
    }

    pub fn unsafe_put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> CResult<()> {
        let b = self.bucket_mut(bucket)?;
        if let Some(log) = &mut b.log {
            log.append(key, Some(value))?;
        }
        b.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn unsafe_delete(&mut self, bucket: &str, key: &[u8]) -> CResult<()> {
        let b = self.bucket_mut(bucket)?;
        if let Some(log) = &mut b.log {
            log.append(key, None)?;
        }
        b.data.remove(key);
        Ok(())
    }

    /// Flushes every durable bucket's log without re-acquiring the backend
    /// lock (it's already held by this transaction's guard). Used when a
    /// caller needs a durability point in the middle of a batch, e.g. to
    /// record compaction intent before proceeding.
    pub fn force_commit(&self) -> CResult<()> {
        for bucket in self.guard.buckets.values() {
            if let Some(log) = &bucket.log {
                log.force_sync()?;
            }
        }
        Ok(())
    }

    /// Ranges `[start, end)` in ascending key order, `limit == 0` meaning
    /// unlimited. `end == None` performs a point lookup at `start`.
    pub fn unsafe_range(
        &self,
        bucket: &str,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> CResult<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let b = self
            .guard
            .buckets
            .get(bucket)
            .ok_or_else(|| Error::Internal(format!("unknown bucket {}", bucket)))?;
        Ok(range_bucket(&b.data, start, end, limit))
    }
}

/// A snapshot read transaction: a point-in-time clone of every bucket,
/// supporting concurrent range reads with no interaction with the writer.
pub struct ReadTx {
    buckets: HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl ReadTx {
    pub fn unsafe_range(
        &self,
        bucket: &str,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> CResult<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let data = self
            .buckets
            .get(bucket)
            .ok_or_else(|| Error::Internal(format!("unknown bucket {}", bucket)))?;
        Ok(range_bucket(data, start, end, limit))
    }
}

fn range_bucket(
    data: &BTreeMap<Vec<u8>, Vec<u8>>,
    start: &[u8],
    end: Option<&[u8]>,
    limit: usize,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut keys = Vec::new();
    let mut values = Vec::new();

    match end {
        None => {
            if let Some(v) = data.get(start) {
                keys.push(start.to_vec());
                values.push(v.clone());
            }
        }
        Some(end) => {
            for (k, v) in data.range(start.to_vec()..end.to_vec()) {
                if limit != 0 && keys.len() >= limit {
                    break;
                }
                keys.push(k.clone());
                values.push(v.clone());
            }
        }
    }

    (keys, values)
}
