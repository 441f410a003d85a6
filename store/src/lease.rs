//! Interfaces to the lease manager and the replicated-log offset source.
//! Both are external collaborators: the store calls out to them but owns
//! neither. Concrete implementations live outside this crate.

use crate::error::CResult;

/// Callback the lease manager invokes when a lease expires, to delete every
/// key still attached to it through a store write transaction.
pub type RangeDeleter = Box<dyn Fn(&[Vec<u8>]) -> CResult<()> + Send + Sync>;

/// Binds and unbinds keys to leases. The store calls `attach`/`detach` as
/// part of `Put`/`DeleteRange`; it never inspects lease state itself.
pub trait LeaseManager: Send + Sync {
    fn attach(&self, lease_id: u64, keys: &[Vec<u8>]) -> CResult<()>;
    fn detach(&self, lease_id: u64, keys: &[Vec<u8>]) -> CResult<()>;
    fn set_range_deleter(&self, deleter: RangeDeleter);
}

/// A lease manager that does nothing. Used where no lease manager is wired
/// in (embedding scenarios, most tests): the store still records each key's
/// lease id for its own bookkeeping, but no attach/detach call has any
/// external effect.
#[derive(Default)]
pub struct NoopLeaseManager;

impl LeaseManager for NoopLeaseManager {
    fn attach(&self, _lease_id: u64, _keys: &[Vec<u8>]) -> CResult<()> {
        Ok(())
    }

    fn detach(&self, _lease_id: u64, _keys: &[Vec<u8>]) -> CResult<()> {
        Ok(())
    }

    fn set_range_deleter(&self, _deleter: RangeDeleter) {}
}

/// Supplies the replicated-log offset of the entry currently being applied,
/// persisted as `consistent_index` on every write commit.
pub trait ConsistentIndexGetter: Send + Sync {
    fn consistent_index(&self) -> u64;
}

/// A `ConsistentIndexGetter` backed by a plain counter, for embedding
/// scenarios with no replicated log underneath.
pub struct StaticConsistentIndex(std::sync::atomic::AtomicU64);

impl StaticConsistentIndex {
    pub fn new(start: u64) -> Self {
        StaticConsistentIndex(std::sync::atomic::AtomicU64::new(start))
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, std::sync::atomic::Ordering::Release);
    }
}

impl ConsistentIndexGetter for StaticConsistentIndex {
    fn consistent_index(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}
