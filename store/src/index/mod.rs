//! The in-memory key index: for every user key ever seen, the history of
//! revisions that wrote or deleted it, grouped into generations. A
//! self-balancing ordered map gives the ordered range scans the store needs;
//! `BTreeMap` offers the same asymptotic and ordering guarantees as the
//! balanced tree the design calls for.

use std::collections::{BTreeMap, HashSet};

use crate::error::{CResult, Error};
use crate::revision::Revision;

/// A contiguous live span of revisions for one user key. `closed` is set
/// when the last entry in `revisions` is the tombstone that ended the
/// generation; the record's final generation is always open (`closed ==
/// false`) until a `Tombstone` call closes it and starts a new one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Generation {
    /// The key's version counter as of the last write in this generation.
    pub version: u64,
    /// Equal to `revisions[0]` whenever the generation is non-empty; tracked
    /// separately because compaction rewrites `revisions[0]` without
    /// pretending the key was created at the retained boundary revision.
    pub created: Revision,
    pub revisions: Vec<Revision>,
    pub closed: bool,
}

impl Generation {
    fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}

/// One user key's generation history.
#[derive(Clone, Debug)]
pub struct KeyIndexRecord {
    pub key: Vec<u8>,
    pub modifications: u64,
    pub generations: Vec<Generation>,
}

impl KeyIndexRecord {
    fn new(key: Vec<u8>) -> Self {
        KeyIndexRecord { key, modifications: 0, generations: vec![Generation::default()] }
    }

    fn is_garbage(&self) -> bool {
        self.generations.iter().all(Generation::is_empty)
    }

    /// Finds the live entry at `at`, searching from the newest generation
    /// backwards. Returns `(modify_rev, create_rev, version)`.
    ///
    /// `version` is derived from `gen.version`, the counter `put` stamps at
    /// write time, not from the revision's current position in `revisions`.
    /// `compact` drains the front of `revisions` for a straddling
    /// generation, which would shift every later entry's index -- deriving
    /// version positionally would make it silently wrong for any key whose
    /// generation has been trimmed by a completed compaction. `Tombstone`
    /// pushes a revision without bumping `gen.version`, so the count of
    /// version-carrying entries is one less than `revisions.len()` for a
    /// closed generation.
    fn get_at(&self, at: Revision) -> Option<(Revision, Revision, u64)> {
        for gen in self.generations.iter().rev() {
            if gen.is_empty() || gen.created > at {
                continue;
            }
            let idx = gen.revisions.iter().rposition(|r| *r <= at)?;
            let is_tombstone_hit = gen.closed && idx == gen.revisions.len() - 1;
            if is_tombstone_hit {
                return None;
            }
            let put_count = gen.revisions.len() - gen.closed as usize;
            let version = gen.version - (put_count - 1 - idx) as u64;
            return Some((gen.revisions[idx], gen.created, version));
        }
        None
    }
}

/// The in-memory ordered map from user key to key-index record.
#[derive(Default)]
pub struct KeyIndex {
    records: BTreeMap<Vec<u8>, KeyIndexRecord>,
}

/// A key's state as of some revision, as returned by `Get` and `Range`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyState {
    pub key: Vec<u8>,
    pub modify_rev: Revision,
    pub create_rev: Revision,
    pub version: u64,
}

impl KeyIndex {
    pub fn new() -> Self {
        KeyIndex { records: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records that `key` was written at `rev`.
    pub fn put(&mut self, key: &[u8], rev: Revision) {
        let record =
            self.records.entry(key.to_vec()).or_insert_with(|| KeyIndexRecord::new(key.to_vec()));
        record.modifications += 1;
        let gen = record.generations.last_mut().expect("record always has an open generation");
        if gen.revisions.is_empty() {
            gen.created = rev;
        }
        gen.version += 1;
        gen.revisions.push(rev);
    }

    /// Closes `key`'s current generation with a tombstone at `rev` and
    /// starts a fresh empty one. Fails with `NotFound` if the key is absent
    /// or its current generation is already closed (empty).
    pub fn tombstone(&mut self, key: &[u8], rev: Revision) -> CResult<()> {
        let record = self.records.get_mut(key).ok_or(Error::NotFound)?;
        let gen = record.generations.last_mut().expect("record always has an open generation");
        if gen.is_empty() {
            return Err(Error::NotFound);
        }
        gen.revisions.push(rev);
        gen.closed = true;
        record.modifications += 1;
        record.generations.push(Generation::default());
        Ok(())
    }

    /// Finds the greatest revision `<= at_rev` recorded for `key`.
    pub fn get(&self, key: &[u8], at_rev: Revision) -> CResult<KeyState> {
        let record = self.records.get(key).ok_or(Error::NotFound)?;
        let (modify_rev, create_rev, version) = record.get_at(at_rev).ok_or(Error::NotFound)?;
        Ok(KeyState { key: key.to_vec(), modify_rev, create_rev, version })
    }

    /// All keys in `[start, end)` live at `at_rev`, in ascending key order.
    pub fn range(&self, start: &[u8], end: &[u8], at_rev: Revision) -> Vec<KeyState> {
        let mut out = Vec::new();
        for (key, record) in self.records.range(start.to_vec()..end.to_vec()) {
            if let Some((modify_rev, create_rev, version)) = record.get_at(at_rev) {
                out.push(KeyState { key: key.clone(), modify_rev, create_rev, version });
            }
        }
        out
    }

    /// Every revision `>= since_rev` recorded for keys in `[start, end)`,
    /// ordered by revision (not key) -- used by watch catch-up.
    pub fn range_since(&self, start: &[u8], end: &[u8], since_rev: Revision) -> Vec<(Vec<u8>, Revision)> {
        let mut out = Vec::new();
        for (key, record) in self.records.range(start.to_vec()..end.to_vec()) {
            for gen in &record.generations {
                for rev in &gen.revisions {
                    if *rev >= since_rev {
                        out.push((key.clone(), *rev));
                    }
                }
            }
        }
        out.sort_by_key(|(_, rev)| *rev);
        out
    }

    /// Drops generations entirely older than `at_rev`; for the generation
    /// straddling it, retains the largest revision `<= at_rev` plus any
    /// newer ones. Removes records left with no generations. Returns every
    /// `(main, sub)` pair that must survive in the backend.
    pub fn compact(&mut self, at_rev: Revision) -> HashSet<Revision> {
        let mut retained = HashSet::new();
        let mut garbage_keys = Vec::new();

        for (key, record) in self.records.iter_mut() {
            let mut kept = Vec::with_capacity(record.generations.len());
            for mut gen in std::mem::take(&mut record.generations) {
                if gen.is_empty() {
                    kept.push(gen);
                    continue;
                }
                let fully_consumed = gen.closed && *gen.revisions.last().unwrap() <= at_rev;
                if fully_consumed {
                    continue;
                }
                if let Some(idx) = gen.revisions.iter().rposition(|r| *r <= at_rev) {
                    gen.revisions.drain(0..idx);
                    gen.created = gen.revisions[0];
                }
                for rev in &gen.revisions {
                    retained.insert(*rev);
                }
                kept.push(gen);
            }
            record.generations = kept;
            if record.is_garbage() {
                garbage_keys.push(key.clone());
            }
        }

        for key in garbage_keys {
            self.records.remove(&key);
        }

        retained
    }
}
