//! Thin read/write views: the named operations (`FirstRev`, `Rev`, `Range`,
//! `Put`, `DeleteRange`, `End`) callers use instead of touching the store's
//! locked primitives directly.

use std::sync::atomic::Ordering;
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{BatchTx, ReadTx, BUCKET_KEY, BUCKET_META, META_CONSISTENT_INDEX};
use crate::error::{CResult, Error};
use crate::index::{KeyIndex, KeyState};
use crate::record::Record;
use crate::revision::Revision;

use super::Store;

/// The outcome of a single `Put`: the revision it was written at and the
/// `(create_rev, version)` pair recorded alongside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub rev: Revision,
    pub create_rev: Revision,
    pub version: u64,
}

/// A fully materialized key/value pair as returned by `Range`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_rev: Revision,
    pub mod_rev: Revision,
    pub version: u64,
}

/// The store's single writer. Holds the store's read-side `mu` guard (to
/// exclude a concurrent restore), the backend's exclusive batch
/// transaction, and the key index's write lock, for its entire lifetime.
/// Declared in the order they should release: index, then batch, then mu.
pub struct WriteTxn<'a> {
    index_guard: RwLockWriteGuard<'a, KeyIndex>,
    batch: BatchTx<'a>,
    _mu_guard: RwLockReadGuard<'a, ()>,
    store: &'a Store,
    base_rev: i64,
    next_sub: i64,
    mutated: bool,
}

impl<'a> WriteTxn<'a> {
    pub(super) fn new(
        store: &'a Store,
        mu_guard: RwLockReadGuard<'a, ()>,
        batch: BatchTx<'a>,
        index_guard: RwLockWriteGuard<'a, KeyIndex>,
        base_rev: i64,
    ) -> Self {
        WriteTxn { index_guard, batch, _mu_guard: mu_guard, store, base_rev, next_sub: 0, mutated: false }
    }

    /// The revision this transaction, once committed, will advance to.
    pub fn rev(&self) -> i64 {
        self.base_rev + 1
    }

    fn next_revision(&mut self) -> Revision {
        let rev = Revision::new(self.rev(), self.next_sub);
        self.next_sub += 1;
        rev
    }

    fn rebind_lease(&mut self, key: &[u8], lease: u64) -> CResult<()> {
        let mut key_to_lease = self.store.key_to_lease().lock().expect("key_to_lease lock poisoned");
        let previous = key_to_lease.get(key.as_ref() as &[u8]).copied();
        if previous != Some(lease) {
            if let Some(previous) = previous {
                if previous != 0 {
                    self.store.lease_manager().detach(previous, std::slice::from_ref(&key.to_vec()))?;
                }
            }
            if lease != 0 {
                self.store.lease_manager().attach(lease, std::slice::from_ref(&key.to_vec()))?;
            }
        }
        if lease != 0 {
            key_to_lease.insert(key.to_vec(), lease);
        } else {
            key_to_lease.remove(key.as_ref() as &[u8]);
        }
        Ok(())
    }

    /// Writes `key = value`, attaching it to `lease` (0 for no lease).
    pub fn put(&mut self, key: &[u8], value: &[u8], lease: u64) -> CResult<PutResult> {
        let existing = self.index_guard.get(key, Revision::new(self.base_rev, i64::MAX)).ok();
        let rev = self.next_revision();

        let (create_rev, version) = match &existing {
            Some(state) => (state.create_rev, state.version + 1),
            None => (rev, 1),
        };

        let record = Record {
            key: key.to_vec(),
            value: value.to_vec(),
            create_main: create_rev.main,
            version,
            lease,
        };
        self.batch.unsafe_put(BUCKET_KEY, &rev.encode(), &record.encode()?)?;
        self.index_guard.put(key, rev);
        self.rebind_lease(key, lease)?;
        self.mutated = true;

        Ok(PutResult { rev, create_rev, version })
    }

    /// Deletes every key in `[start, end)` as of this transaction's base
    /// revision. Returns how many keys were deleted.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> CResult<usize> {
        let live: Vec<KeyState> =
            self.index_guard.range(start, end, Revision::new(self.base_rev, i64::MAX));

        for state in &live {
            let rev = self.next_revision();
            let record = Record {
                key: state.key.clone(),
                value: Vec::new(),
                create_main: state.create_rev.main,
                version: state.version + 1,
                lease: 0,
            };
            self.batch.unsafe_put(BUCKET_KEY, &rev.encode_tombstone(), &record.encode()?)?;
            self.index_guard.tombstone(&state.key, rev)?;
            self.rebind_lease(&state.key, 0)?;
        }
        if !live.is_empty() {
            self.mutated = true;
        }

        Ok(live.len())
    }

    /// Commits the transaction, returning the new current revision. A
    /// transaction that made no mutations leaves `current_rev` unchanged.
    pub fn end(mut self) -> CResult<i64> {
        if !self.mutated {
            return Ok(self.base_rev);
        }

        let consistent_index = self.store.consistent_index_getter().consistent_index();
        self.batch.unsafe_put(BUCKET_META, META_CONSISTENT_INDEX, &consistent_index.to_be_bytes())?;
        self.store.consistent_index_cache().store(consistent_index, Ordering::Release);

        let new_rev = self.rev();
        self.store.rev_state_advance(new_rev);
        Ok(new_rev)
    }
}

/// A read-only snapshot transaction over `(first_rev, current_rev)`.
pub struct ReadTxn<'a> {
    _mu_guard: RwLockReadGuard<'a, ()>,
    backend_read: ReadTx,
    store: &'a Store,
    current_rev: i64,
    compact_main_rev: i64,
}

impl<'a> ReadTxn<'a> {
    pub(super) fn new(
        store: &'a Store,
        mu_guard: RwLockReadGuard<'a, ()>,
        backend_read: ReadTx,
        current_rev: i64,
        compact_main_rev: i64,
    ) -> Self {
        ReadTxn { _mu_guard: mu_guard, backend_read, store, current_rev, compact_main_rev }
    }

    pub fn current_rev(&self) -> i64 {
        self.current_rev
    }

    /// The oldest revision still queryable through this snapshot.
    pub fn first_rev(&self) -> i64 {
        self.compact_main_rev + 1
    }

    /// Returns every live key in `[start, end)` as of `at_rev` (0 meaning
    /// "this snapshot's current revision"), plus the revision actually used.
    /// `limit` of 0 means unlimited.
    pub fn range(&self, start: &[u8], end: &[u8], at_rev: i64, limit: usize) -> CResult<(Vec<KeyValue>, i64)> {
        let at_rev = if at_rev <= 0 { self.current_rev } else { at_rev };
        if at_rev > self.current_rev {
            return Err(Error::FutureRev);
        }
        if at_rev < self.first_rev() {
            return Err(Error::Compacted);
        }

        let index = self.store_index()?;
        let mut states = index.range(start, end, Revision::new(at_rev, i64::MAX));
        if limit != 0 && states.len() > limit {
            states.truncate(limit);
        }

        let mut out = Vec::with_capacity(states.len());
        for state in states {
            let (_, values) = self.backend_read.unsafe_range(BUCKET_KEY, &state.modify_rev.encode(), None, 0)?;
            let raw = values.into_iter().next().ok_or_else(|| {
                Error::Corruption(format!("key index points at a missing backend row for {:?}", state.key))
            })?;
            let record = Record::decode(&raw)?;
            out.push(KeyValue {
                key: state.key,
                value: record.value,
                create_rev: state.create_rev,
                mod_rev: state.modify_rev,
                version: state.version,
            });
        }

        Ok((out, at_rev))
    }

    fn store_index(&self) -> CResult<std::sync::RwLockReadGuard<'_, KeyIndex>> {
        self.store.index_for_read()
    }
}
