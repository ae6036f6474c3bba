use cordon_identity_core::Id;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};

/// In-process free-list over the identity range.
///
/// The pool is an optimization, not the source of truth: it is seeded from
/// the store's master keys at startup, so two nodes may lease the same ID
/// concurrently. The master-key compare-and-set resolves that race; the
/// loser returns its lease with [`IdPool::release`] and tries another ID.
///
/// A leased ID is unavailable to other callers but not yet committed; it is
/// either committed with [`IdPool::use_id`] once the master key is published
/// or returned with [`IdPool::release`].
#[derive(Debug)]
pub struct IdPool {
    min: Id,
    max: Id,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// IDs believed to be unallocated, lowest first.
    free: BTreeSet<Id>,
    /// IDs handed out but not yet committed.
    leased: HashSet<Id>,
}

// === impl IdPool ===

impl IdPool {
    pub fn new(min: Id, max: Id) -> Self {
        let free = (min.as_u64()..=max.as_u64()).map(Id::new).collect();
        Self {
            min,
            max,
            inner: Mutex::new(Inner {
                free,
                leased: HashSet::new(),
            }),
        }
    }

    pub fn min(&self) -> Id {
        self.min
    }

    pub fn max(&self) -> Id {
        self.max
    }

    /// Leases the lowest available ID, if any.
    pub fn lease_available_id(&self) -> Option<Id> {
        let mut inner = self.inner.lock();
        let id = inner.free.iter().next().copied()?;
        inner.free.remove(&id);
        inner.leased.insert(id);
        Some(id)
    }

    /// Commits a leased ID. Returns false if `id` was not leased.
    pub fn use_id(&self, id: Id) -> bool {
        self.inner.lock().leased.remove(&id)
    }

    /// Returns a leased ID to the pool. Returns false if `id` was not
    /// leased.
    pub fn release(&self, id: Id) -> bool {
        let mut inner = self.inner.lock();
        if !inner.leased.remove(&id) {
            return false;
        }
        inner.free.insert(id);
        true
    }

    /// Marks an ID allocated elsewhere as unavailable.
    pub fn remove(&self, id: Id) {
        let mut inner = self.inner.lock();
        inner.free.remove(&id);
        inner.leased.remove(&id);
    }

    /// Returns a reclaimed ID to the pool. IDs outside the range are
    /// ignored.
    pub fn insert(&self, id: Id) {
        if id < self.min || id > self.max {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.leased.contains(&id) {
            inner.free.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_lowest_first() {
        let pool = IdPool::new(Id::new(10), Id::new(12));
        assert_eq!(pool.lease_available_id(), Some(Id::new(10)));
        assert_eq!(pool.lease_available_id(), Some(Id::new(11)));
        assert_eq!(pool.lease_available_id(), Some(Id::new(12)));
        assert_eq!(pool.lease_available_id(), None);
    }

    #[test]
    fn release_returns_a_lease() {
        let pool = IdPool::new(Id::new(1), Id::new(1));
        let id = pool.lease_available_id().unwrap();
        assert!(pool.release(id));
        assert!(!pool.release(id), "double release must be rejected");
        assert_eq!(pool.lease_available_id(), Some(id));
    }

    #[test]
    fn use_commits_a_lease() {
        let pool = IdPool::new(Id::new(1), Id::new(2));
        let id = pool.lease_available_id().unwrap();
        assert!(pool.use_id(id));
        assert!(!pool.use_id(id));
        // A committed ID only comes back through insert.
        assert_eq!(pool.lease_available_id(), Some(Id::new(2)));
        pool.insert(id);
        pool.release(Id::new(2));
        assert_eq!(pool.lease_available_id(), Some(id));
    }

    #[test]
    fn seeding_removes_store_owned_ids() {
        let pool = IdPool::new(Id::new(1), Id::new(3));
        pool.remove(Id::new(1));
        pool.remove(Id::new(2));
        assert_eq!(pool.lease_available_id(), Some(Id::new(3)));
        assert_eq!(pool.lease_available_id(), None);
    }

    #[test]
    fn insert_ignores_out_of_range_ids() {
        let pool = IdPool::new(Id::new(5), Id::new(6));
        pool.insert(Id::new(99));
        pool.remove(Id::new(5));
        pool.remove(Id::new(6));
        assert_eq!(pool.lease_available_id(), None);
    }
}
