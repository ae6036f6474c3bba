//! In-process projection of the master-key stream.
//!
//! A single watcher task feeds events into the cache; readers (policy
//! evaluation, datapath reconciliation) consult it through cheap lookups
//! and through [`cordon_identity_core::CacheObserver`] subscriptions.

use ahash::AHashMap as HashMap;
use cordon_identity_core::{AllocatorKey, CacheObserver, Id};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

/// Receives master-key watch events. Implemented by [`Cache`] and by the
/// allocator facade, which keeps its ID pool in step with the stream.
pub trait CacheMutations<K>: Send + Sync + 'static {
    fn on_upsert(&self, id: Id, key: K, mod_revision: u64);

    /// `key` is unavailable when the deletion carried no value and the
    /// identity was never cached.
    fn on_delete(&self, id: Id, key: Option<K>, mod_revision: u64);

    fn on_list_done(&self);
}

/// The identity lookup cache.
pub struct Cache<K> {
    inner: RwLock<Inner<K>>,
    observers: RwLock<Vec<Box<dyn CacheObserver<K>>>>,
    ready: watch::Sender<bool>,
}

struct Inner<K> {
    by_id: HashMap<Id, Cached<K>>,
    by_key: HashMap<String, Id>,
    synced: bool,
}

struct Cached<K> {
    key: K,
    /// Revision of the latest observed event for this identity. Events
    /// replayed out of order or twice must not regress the entry.
    mod_revision: u64,
}

// === impl Cache ===

impl<K: AllocatorKey> Cache<K> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
                synced: false,
            }),
            observers: RwLock::new(Vec::new()),
            ready: watch::channel(false).0,
        }
    }

    /// Registers an observer. Observers registered before the watcher
    /// starts see the full replay, including the initial list-done.
    pub fn subscribe(&self, observer: Box<dyn CacheObserver<K>>) {
        self.observers.write().push(observer);
    }

    /// A receiver that flips to true once initial synchronization is done.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn get(&self, canonical: &str) -> Option<Id> {
        self.inner.read().by_key.get(canonical).copied()
    }

    pub fn get_by_id(&self, id: Id) -> Option<K> {
        self.inner.read().by_id.get(&id).map(|c| c.key.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(Id, &K)) {
        for (id, cached) in self.inner.read().by_id.iter() {
            f(*id, &cached.key);
        }
    }

    /// Seeds a mapping this node just allocated so that the allocating
    /// client observes its own write before the watch echoes it.
    pub(crate) fn insert_local(&self, id: Id, key: &K) {
        let mut inner = self.inner.write();
        let mod_revision = inner.by_id.get(&id).map(|c| c.mod_revision).unwrap_or(0);
        inner.by_key.insert(key.as_key(), id);
        inner.by_id.insert(
            id,
            Cached {
                key: key.clone(),
                mod_revision,
            },
        );
    }
}

impl<K: AllocatorKey> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AllocatorKey> CacheMutations<K> for Cache<K> {
    fn on_upsert(&self, id: Id, key: K, mod_revision: u64) {
        {
            let mut inner = self.inner.write();
            if let Some(cached) = inner.by_id.get(&id) {
                if mod_revision < cached.mod_revision {
                    debug!(%id, mod_revision, "ignoring stale upsert");
                    return;
                }
                // The binding of an ID never changes in normal operation,
                // but a re-created master key must not leave the inverse
                // map pointing at the old encoding.
                let stale = cached.key.as_key();
                if stale != key.as_key() && inner.by_key.get(&stale) == Some(&id) {
                    inner.by_key.remove(&stale);
                }
            }
            inner.by_key.insert(key.as_key(), id);
            inner.by_id.insert(
                id,
                Cached {
                    key: key.clone(),
                    mod_revision,
                },
            );
        }

        for observer in self.observers.read().iter() {
            observer.on_upsert(id, &key);
        }
    }

    fn on_delete(&self, id: Id, key: Option<K>, _mod_revision: u64) {
        let cached = {
            let mut inner = self.inner.write();
            match inner.by_id.remove(&id) {
                Some(cached) => {
                    let canonical = cached.key.as_key();
                    if inner.by_key.get(&canonical) == Some(&id) {
                        inner.by_key.remove(&canonical);
                    }
                    Some(cached.key)
                }
                None => None,
            }
        };

        let key = cached.or(key);
        for observer in self.observers.read().iter() {
            observer.on_delete(id, key.as_ref());
        }
    }

    fn on_list_done(&self) {
        let first = {
            let mut inner = self.inner.write();
            !std::mem::replace(&mut inner.synced, true)
        };
        if !first {
            debug!("identity watch resynchronized");
            return;
        }
        self.ready.send_replace(true);
        for observer in self.observers.read().iter() {
            observer.on_list_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_identity_core::LabelSet;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn key(s: &str) -> LabelSet {
        LabelSet::decode(s)
    }

    #[test]
    fn out_of_order_upserts_do_not_regress() {
        let cache = Cache::<LabelSet>::new();
        cache.on_upsert(Id::new(7), key("app=web;"), 5);
        // A replayed older event must be ignored.
        cache.on_upsert(Id::new(7), key("app=old;"), 3);
        assert_eq!(cache.get_by_id(Id::new(7)).unwrap().encode(), "app=web;");
        assert_eq!(cache.get("app=web;"), Some(Id::new(7)));
        assert_eq!(cache.get("app=old;"), None);
    }

    #[test]
    fn duplicate_events_are_idempotent() {
        let cache = Cache::<LabelSet>::new();
        cache.on_upsert(Id::new(7), key("app=web;"), 5);
        cache.on_upsert(Id::new(7), key("app=web;"), 5);
        assert_eq!(cache.len(), 1);
        cache.on_delete(Id::new(7), None, 6);
        cache.on_delete(Id::new(7), None, 6);
        assert!(cache.is_empty());
        assert_eq!(cache.get("app=web;"), None);
    }

    #[test]
    fn rebinding_updates_the_inverse_map() {
        let cache = Cache::<LabelSet>::new();
        cache.on_upsert(Id::new(7), key("app=a;"), 1);
        cache.on_upsert(Id::new(7), key("app=b;"), 2);
        assert_eq!(cache.get("app=a;"), None);
        assert_eq!(cache.get("app=b;"), Some(Id::new(7)));
    }

    #[test]
    fn list_done_notifies_exactly_once() {
        struct CountDone(AtomicUsize);
        struct CountDoneHandle(Arc<CountDone>);
        impl CacheObserver<LabelSet> for CountDoneHandle {
            fn on_upsert(&self, _: Id, _: &LabelSet) {}
            fn on_delete(&self, _: Id, _: Option<&LabelSet>) {}
            fn on_list_done(&self) {
                self.0.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let cache = Cache::<LabelSet>::new();
        let done = Arc::new(CountDone(AtomicUsize::new(0)));
        cache.subscribe(Box::new(CountDoneHandle(done.clone())));
        let mut ready = cache.ready();
        assert!(!*ready.borrow());

        cache.on_list_done();
        // A watcher restart replays list-done; it must not re-notify.
        cache.on_list_done();
        assert_eq!(done.0.load(Ordering::SeqCst), 1);
        assert!(*ready.borrow_and_update());
    }
}
