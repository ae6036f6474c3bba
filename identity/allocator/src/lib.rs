//! Cluster-wide identity allocation over a shared key-value store.
//!
//! The allocator assigns small cluster-unique integers ([`Id`]) to
//! canonical label-set keys. State lives in the store at three prefixes:
//!
//! - `{base}/id/{ID}`: authoritative master keys, one per live identity;
//! - `{base}/value/{key}/{node}`: per-node, lease-bound slave keys proving
//!   a mapping is in use;
//! - `{base}/locks/...`: distributed locks serializing allocation against
//!   garbage collection.
//!
//! A single watcher task projects the master-key stream into the local
//! [`Cache`]; [`Allocator::allocate`] consults the cache first and only
//! races for a new master key (create-if-absent on `id/{ID}`) when the key
//! is unknown cluster-wide. Releases are local: the last local use deletes
//! this node's slave key, and the [`GcRunner`] eventually reaps master keys
//! that two consecutive cycles observe unreferenced at an unchanged
//! modification revision.
//!
//! ```ignore
//! [ caller ] -> Allocator -> Backend -> Store
//!                  |            ^
//!                  v            |
//!               Cache <- list_and_watch
//! ```
//!
//! Every operation is cancel-safe: dropping a future may leave the
//! operation incomplete, but store mutations are atomic, so local and
//! remote state never tear.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backend;
mod cache;
mod gc;
mod idpool;
mod metrics;

pub use self::{
    backend::{Backend, GcStats, KvstoreBackend, LockOwner, StaleKeys, StaleLocks},
    cache::{Cache, CacheMutations},
    gc::{GcRunner, RateLimiter},
    idpool::IdPool,
    metrics::GcMetrics,
};
pub use cordon_identity_core::{AllocatorKey, CacheObserver, Id, LabelSet};

use ahash::AHashMap as HashMap;
use cordon_identity_kvstore as kvstore;
use parking_lot::Mutex;
use std::{collections::hash_map::Entry, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info_span, warn, Instrument};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another node published this ID for a different key; the caller
    /// leases a fresh ID and retries.
    #[error("identity {0} is already allocated to another key")]
    IdConflict(Id),

    #[error("no identities available in the local range")]
    PoolExhausted,

    #[error("identity allocation did not converge after {0} attempts")]
    AttemptsExceeded(usize),

    /// The key has no live allocation on this node.
    #[error("key is not allocated on this node")]
    NotLocal,

    /// The identity watch terminated before initial synchronization.
    #[error("identity watch terminated")]
    WatchTerminated,

    #[error(transparent)]
    Store(#[from] kvstore::Error),
}

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Smallest identity this cluster may allocate.
    pub min: Id,

    /// Largest identity this cluster may allocate.
    pub max: Id,

    /// Candidate IDs tried before an allocation fails.
    pub max_alloc_attempts: usize,

    /// How often this node re-asserts the master and slave keys of its
    /// live mappings.
    pub sync_interval: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min: Id::new(256),
            max: Id::new(65535),
            max_alloc_attempts: 16,
            sync_interval: Duration::from_secs(300),
        }
    }
}

/// The public allocation API.
///
/// Holds the per-process refcounts: allocating an already-held key is a
/// refcount bump, and only the release of the last local use touches the
/// store. One allocator instance exists per identity range.
pub struct Allocator<K: AllocatorKey, B: Backend<K>> {
    backend: Arc<B>,
    pool: IdPool,
    cache: Arc<Cache<K>>,
    local_keys: Mutex<HashMap<String, LocalRef<K>>>,

    /// Serializes slave-key deletion against reference acquisition for the
    /// same key on this node. Cross-node races are handled by the store's
    /// atomic primitives and the two-phase GC.
    slave_keys_mutex: tokio::sync::Mutex<()>,

    ready: watch::Receiver<bool>,
    max_alloc_attempts: usize,
}

struct LocalRef<K> {
    id: Id,
    key: K,
    uses: usize,
}

// === impl Allocator ===

impl<K: AllocatorKey, B: Backend<K>> Allocator<K, B> {
    /// Seeds the ID pool from the store's master keys and spawns the
    /// watcher, the periodic local-key sync and the lease-loss handler.
    pub async fn new(
        backend: Arc<B>,
        config: AllocatorConfig,
        drain: drain::Watch,
    ) -> Result<Arc<Self>> {
        let pool = IdPool::new(config.min, config.max);
        for id in backend.list_ids().await? {
            pool.remove(id);
        }

        let cache = Arc::new(Cache::new());
        let allocator = Arc::new(Self {
            backend: backend.clone(),
            pool,
            ready: cache.ready(),
            cache,
            local_keys: Mutex::new(HashMap::new()),
            slave_keys_mutex: tokio::sync::Mutex::new(()),
            max_alloc_attempts: config.max_alloc_attempts,
        });

        let handler: Arc<dyn CacheMutations<K>> = allocator.clone();
        tokio::spawn(
            backend
                .list_and_watch(handler, drain.clone())
                .instrument(info_span!("identities")),
        );
        tokio::spawn(
            Self::sync_local_keys(allocator.clone(), config.sync_interval, drain.clone())
                .instrument(info_span!("identity-sync")),
        );
        tokio::spawn(Self::invalidate_on_lease_loss(allocator.clone(), drain));

        Ok(allocator)
    }

    /// Allocates an identity for `key`, blocking until the cache completes
    /// initial synchronization. Returns the identity and whether this call
    /// published it cluster-wide.
    pub async fn allocate(&self, key: &K) -> Result<(Id, bool)> {
        self.synchronized().await?;
        let canonical = key.as_key();

        for attempt in 0..self.max_alloc_attempts {
            // Already used on this node: bump the refcount.
            if let Some(id) = self.incr_local(&canonical) {
                return Ok((id, false));
            }

            // Already allocated cluster-wide: take a reference to it.
            if let Some(id) = self.cache.get(&canonical) {
                let _guard = self.slave_keys_mutex.lock().await;
                if let Some(id) = self.incr_local(&canonical) {
                    return Ok((id, false));
                }
                self.backend.acquire_reference(id, key, None).await?;
                self.note_local_use(&canonical, id, key);
                return Ok((id, false));
            }

            // Unknown key: lease a candidate ID and race for the master key
            // under the per-key lock.
            let id = self.pool.lease_available_id().ok_or(Error::PoolExhausted)?;
            let lock = match self.backend.lock(key).await {
                Ok(lock) => lock,
                Err(error) => {
                    self.pool.release(id);
                    return Err(error);
                }
            };

            // Re-check now that the key is locked: the lock may have been
            // held by a racing allocation of this very key.
            if let Some(existing) = self.incr_local(&canonical) {
                self.pool.release(id);
                let _ = lock.unlock().await;
                return Ok((existing, false));
            }
            match self.backend.get_if_locked(key, &*lock).await {
                Ok(Some(existing)) => {
                    self.pool.release(id);
                    let acquired = {
                        let _guard = self.slave_keys_mutex.lock().await;
                        self.backend
                            .acquire_reference(existing, key, Some(&*lock))
                            .await
                    };
                    let _ = lock.unlock().await;
                    acquired?;
                    self.cache.insert_local(existing, key);
                    self.note_local_use(&canonical, existing, key);
                    return Ok((existing, false));
                }
                Ok(None) => {}
                Err(error) => {
                    self.pool.release(id);
                    let _ = lock.unlock().await;
                    return Err(error);
                }
            }

            match self.backend.allocate_id_if_locked(id, key, &*lock).await {
                Ok(()) => {}
                Err(Error::IdConflict(_)) => {
                    // Another node claimed this ID for a different key. The
                    // conflict proves the ID is taken cluster-wide, so the
                    // lease is committed rather than returned; the next
                    // attempt draws a different candidate. Deleting the
                    // master key re-opens the ID through the watch.
                    self.pool.use_id(id);
                    let _ = lock.unlock().await;
                    debug!(%id, attempt, "identity already in use, retrying");
                    continue;
                }
                Err(error) => {
                    self.pool.release(id);
                    let _ = lock.unlock().await;
                    return Err(error);
                }
            }

            let acquired = {
                let _guard = self.slave_keys_mutex.lock().await;
                self.backend.acquire_reference(id, key, Some(&*lock)).await
            };
            if let Err(error) = acquired {
                // The master key is published but unreferenced; garbage
                // collection reclaims it after two cycles.
                self.pool.release(id);
                let _ = lock.unlock().await;
                return Err(error);
            }

            self.pool.use_id(id);
            if let Err(error) = lock.unlock().await {
                warn!(%error, key = %canonical, "failed to release allocation lock");
            }
            self.cache.insert_local(id, key);
            self.note_local_use(&canonical, id, key);
            return Ok((id, true));
        }

        Err(Error::AttemptsExceeded(self.max_alloc_attempts))
    }

    /// Releases one local use of `key`. Releasing the last local use
    /// deletes this node's slave key; the master key remains until garbage
    /// collection observes it unreferenced. Returns whether this was the
    /// last local use.
    pub async fn release(&self, key: &K) -> Result<bool> {
        let canonical = key.as_key();
        let _guard = self.slave_keys_mutex.lock().await;
        let last = {
            let mut local = self.local_keys.lock();
            let uses = match local.get_mut(&canonical) {
                Some(r) => {
                    r.uses -= 1;
                    r.uses
                }
                None => return Err(Error::NotLocal),
            };
            if uses == 0 {
                local.remove(&canonical).map(|r| r.id)
            } else {
                None
            }
        };
        match last {
            Some(id) => {
                self.backend.release(id, key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resolves the identity of `key` from the cache, falling back to the
    /// store for keys this node has not yet observed.
    pub async fn get(&self, key: &K) -> Result<Option<Id>> {
        if let Some(id) = self.cache.get(&key.as_key()) {
            return Ok(Some(id));
        }
        self.backend.get(key).await
    }

    pub async fn get_by_id(&self, id: Id) -> Result<Option<K>> {
        if let Some(key) = self.cache.get_by_id(id) {
            return Ok(Some(key));
        }
        self.backend.get_by_id(id).await
    }

    /// Read-only iteration over the cached mappings.
    pub fn for_each_cached(&self, f: impl FnMut(Id, &K)) {
        self.cache.for_each(f)
    }

    /// The cache backing this allocator's reads.
    pub fn cache(&self) -> &Cache<K> {
        &self.cache
    }

    /// The number of live local uses of `key`.
    pub fn local_uses(&self, key: &K) -> usize {
        self.local_keys
            .lock()
            .get(&key.as_key())
            .map(|r| r.uses)
            .unwrap_or(0)
    }

    /// Registers a cache observer.
    pub fn subscribe(&self, observer: Box<dyn CacheObserver<K>>) {
        self.cache.subscribe(observer)
    }

    /// One identity garbage-collection cycle over this allocator's range.
    /// [`GcRunner`] drives this periodically; schedulers with their own
    /// cadence call it directly, threading the stale map between cycles.
    pub async fn run_gc(
        &self,
        limiter: &RateLimiter,
        stale_prev_round: &StaleKeys,
    ) -> Result<(StaleKeys, GcStats)> {
        self.backend
            .run_gc(limiter, stale_prev_round, self.pool.min(), self.pool.max())
            .await
    }

    /// One lock garbage-collection round.
    pub async fn run_locks_gc(&self, stale_prev_round: &StaleLocks) -> Result<StaleLocks> {
        self.backend.run_locks_gc(stale_prev_round).await
    }

    /// Completes once the cache has finished initial synchronization.
    pub async fn synchronized(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::WatchTerminated)?;
        Ok(())
    }

    fn incr_local(&self, canonical: &str) -> Option<Id> {
        let mut local = self.local_keys.lock();
        let r = local.get_mut(canonical)?;
        r.uses += 1;
        Some(r.id)
    }

    fn note_local_use(&self, canonical: &str, id: Id, key: &K) {
        let mut local = self.local_keys.lock();
        match local.entry(canonical.to_string()) {
            Entry::Occupied(mut entry) => entry.get_mut().uses += 1,
            Entry::Vacant(entry) => {
                entry.insert(LocalRef {
                    id,
                    key: key.clone(),
                    uses: 1,
                });
            }
        }
    }

    /// Re-asserts the master and slave keys of every live local mapping so
    /// that keys lost to store hiccups are restored before garbage
    /// collection can misread them.
    async fn sync_local_keys(this: Arc<Self>, period: Duration, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = interval.tick() => {}
            }
            let refs: Vec<(Id, K)> = this
                .local_keys
                .lock()
                .values()
                .map(|r| (r.id, r.key.clone()))
                .collect();
            for (id, key) in refs {
                if let Err(error) = this.backend.update_key(id, &key, false).await {
                    warn!(%error, %id, %key, "unable to refresh identity registration");
                }
            }
        }
    }

    /// Losing the store lease is equivalent to a graceful exit: the slave
    /// keys are gone, so the local refcounts no longer prove anything.
    async fn invalidate_on_lease_loss(this: Arc<Self>, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        let mut lost = this.backend.lease_lost();
        tokio::select! {
            _ = &mut shutdown => {}
            res = lost.wait_for(|lost| *lost) => {
                if res.is_ok() {
                    warn!("kvstore lease lost; local identity references are no longer authoritative");
                    this.local_keys.lock().clear();
                }
            }
        }
    }
}

impl<K: AllocatorKey, B: Backend<K>> CacheMutations<K> for Allocator<K, B> {
    fn on_upsert(&self, id: Id, key: K, mod_revision: u64) {
        // An identity observed in the store is unavailable for leasing,
        // whichever node allocated it.
        self.pool.remove(id);
        self.cache.on_upsert(id, key, mod_revision);
    }

    fn on_delete(&self, id: Id, key: Option<K>, mod_revision: u64) {
        // Reclaimed by the garbage collector: the ID may be reused. The
        // pool is replenished before the cache entry goes so a reader that
        // observes the removal can immediately re-lease the ID.
        self.pool.insert(id);
        self.cache.on_delete(id, key, mod_revision);
    }

    fn on_list_done(&self) {
        self.cache.on_list_done();
    }
}
