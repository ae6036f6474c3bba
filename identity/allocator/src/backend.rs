//! Store-backed allocation backend.
//!
//! Identities are stored in two levels:
//!
//! Master keys are the authoritative `ID -> key` bindings, one per live
//! identity:
//!
//! - `{base}/id/1001 => app=web;`
//! - `{base}/id/1002 => app=db;`
//!
//! Slave keys are owned by individual nodes and prove that a mapping is in
//! use; they are lease-bound and evaporate when their node fails to renew:
//!
//! - `{base}/value/app=web;/10.16.0.4 => 1001`
//! - `{base}/value/app=web;/10.16.0.9 => 1001`
//!
//! If at least one slave key exists under `{base}/value/{key}/` the mapping
//! is in use. A master key that is no longer backed by any slave key is
//! eventually reaped by [`Backend::run_gc`] and its ID returns to the pool.

use crate::{cache::CacheMutations, gc::RateLimiter, Error, Result};
use cordon_identity_core::{prefix_matches_key, AllocatorKey, Id};
use cordon_identity_kvstore::{self as kvstore, EventType, Store, StoreLock};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Master keys observed unreferenced by the previous collection cycle,
/// with the modification revision at which they were observed.
pub type StaleKeys = ahash::AHashMap<String, u64>;

/// Locks observed in the previous collection round.
pub type StaleLocks = ahash::AHashMap<String, LockOwner>;

/// Identifies who held a lock when it was last observed. A lock is only
/// reclaimed when both fields are unchanged across two observations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOwner {
    pub mod_revision: u64,
    pub lease: Option<kvstore::LeaseId>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Master keys still alive after the cycle.
    pub alive: usize,
    /// Master keys deleted by the cycle.
    pub deleted: usize,
}

/// Storage operations the allocator facade is built on.
#[async_trait::async_trait]
pub trait Backend<K: AllocatorKey>: Send + Sync + 'static {
    /// Publishes the master key binding `id` to `key` with create-if-absent
    /// semantics. Fails with [`Error::IdConflict`] when the ID is taken;
    /// the caller retries with a different ID.
    async fn allocate_id(&self, id: Id, key: &K) -> Result<()>;

    /// [`Backend::allocate_id`] under a held per-key lock.
    async fn allocate_id_if_locked(&self, id: Id, key: &K, lock: &dyn StoreLock) -> Result<()>;

    /// Idempotently records that this node uses the mapping by writing its
    /// lease-bound slave key. Safe to call repeatedly on renewal.
    async fn acquire_reference(
        &self,
        id: Id,
        key: &K,
        lock: Option<&dyn StoreLock>,
    ) -> Result<()>;

    /// Deletes this node's slave key. Callers serialize this against
    /// concurrent reference acquisition for the same key on this node.
    async fn release(&self, id: Id, key: &K) -> Result<()>;

    /// Re-creates any missing master or slave key for a mapping this node
    /// believes it owns. With `reliably_missing` the slave key is written
    /// create-if-absent; otherwise update-if-different avoids revision
    /// churn when the key is already correct.
    async fn update_key(&self, id: Id, key: &K, reliably_missing: bool) -> Result<()>;

    /// Resolves the ID allocated to `key`, if any, from its slave keys.
    async fn get(&self, key: &K) -> Result<Option<Id>>;

    /// [`Backend::get`] under a held per-key lock.
    async fn get_if_locked(&self, key: &K, lock: &dyn StoreLock) -> Result<Option<Id>>;

    /// Reads the key bound to `id` from its master key.
    async fn get_by_id(&self, id: Id) -> Result<Option<K>>;

    /// Acquires the distributed per-key lock serializing allocation against
    /// garbage collection for `key`.
    async fn lock(&self, key: &K) -> Result<Box<dyn StoreLock>>;

    /// Enumerates the IDs of all current master keys; used to seed the ID
    /// pool at startup.
    async fn list_ids(&self) -> Result<Vec<Id>>;

    /// Streams master-key mutations into `handler` until drained,
    /// re-synchronizing whenever the underlying watch ends.
    async fn list_and_watch(
        self: Arc<Self>,
        handler: Arc<dyn CacheMutations<K>>,
        drain: drain::Watch,
    );

    /// One identity garbage-collection cycle; see the crate docs for the
    /// two-phase protocol. Returns this cycle's stale map and statistics.
    async fn run_gc(
        &self,
        limiter: &RateLimiter,
        stale_prev_round: &StaleKeys,
        min: Id,
        max: Id,
    ) -> Result<(StaleKeys, GcStats)>;

    /// One lock garbage-collection round: reclaims locks observed twice
    /// with an unchanged owner. Returns the locks currently held.
    async fn run_locks_gc(&self, stale_prev_round: &StaleLocks) -> Result<StaleLocks>;

    /// Removes every key managed by this allocator. Intended for teardown.
    async fn delete_all_keys(&self) -> Result<()>;

    /// Observes loss of the store client's lease.
    fn lease_lost(&self) -> watch::Receiver<bool>;
}

/// [`Backend`] implementation over a [`Store`].
pub struct KvstoreBackend {
    store: Arc<dyn Store>,

    /// Prefix shared by every key this allocator manages, typically
    /// `{cluster}/state/identities/v1`.
    base_prefix: String,

    /// Master-key prefix, derived from the base prefix.
    id_prefix: String,

    /// Slave-key prefix, derived from the base prefix.
    value_prefix: String,

    /// Lock prefix; distinct from the others so watching for identity
    /// changes is not disturbed by lock traffic.
    lock_prefix: String,

    /// Node-specific suffix appended to slave keys, typically the node's
    /// primary IP address.
    suffix: String,
}

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

// === impl KvstoreBackend ===

impl KvstoreBackend {
    pub fn new(
        store: Arc<dyn Store>,
        base_path: impl Into<String>,
        node_suffix: impl Into<String>,
    ) -> Self {
        let base = base_path.into();
        Self {
            id_prefix: format!("{base}/id"),
            value_prefix: format!("{base}/value"),
            lock_prefix: format!("{base}/locks"),
            base_prefix: base,
            suffix: node_suffix.into(),
            store,
        }
    }

    fn id_path(&self, id: Id) -> String {
        format!("{}/{}", self.id_prefix, id)
    }

    fn value_path(&self, canonical: &str) -> String {
        format!("{}/{}", self.value_prefix, canonical)
    }

    fn slave_path(&self, canonical: &str) -> String {
        format!("{}/{}/{}", self.value_prefix, canonical, self.suffix)
    }

    fn lock_path(&self, key: &str) -> String {
        let suffix = key.strip_prefix(&self.base_prefix).unwrap_or(key);
        format!("{}/{}", self.lock_prefix, suffix.trim_start_matches('/'))
    }

    fn key_to_id(&self, key: &str) -> Option<Id> {
        key.strip_prefix(&self.id_prefix)?
            .strip_prefix('/')?
            .parse()
            .ok()
    }

    /// Picks the ID out of a slave-key listing, ignoring slave keys that
    /// belong to a superset canonical key sharing the byte prefix.
    fn select_id(prefix: &str, pairs: &kvstore::KeyValuePairs) -> Option<Id> {
        pairs.iter().find_map(|(key, value)| {
            if !prefix_matches_key(prefix, key) {
                return None;
            }
            std::str::from_utf8(&value.data).ok()?.parse().ok()
        })
    }

    fn handle_event<K: AllocatorKey>(
        &self,
        event: kvstore::Event,
        handler: &dyn CacheMutations<K>,
    ) {
        if event.typ == EventType::ListDone {
            handler.on_list_done();
            return;
        }

        let id = match self.key_to_id(&event.key) {
            Some(id) => id,
            None => {
                warn!(key = %event.key, "ignoring event for invalid identity key");
                return;
            }
        };

        let key = if event.value.is_empty() {
            if event.typ != EventType::Delete {
                error!(key = %event.key, typ = %event.typ, "received a non-delete event with an empty value");
                return;
            }
            None
        } else {
            Some(K::put_key(&String::from_utf8_lossy(&event.value)))
        };

        match (event.typ, key) {
            (EventType::Create | EventType::Modify, Some(key)) => {
                handler.on_upsert(id, key, event.mod_revision)
            }
            (EventType::Delete, key) => handler.on_delete(id, key, event.mod_revision),
            _ => {}
        }
    }
}

#[async_trait::async_trait]
impl<K: AllocatorKey> Backend<K> for KvstoreBackend {
    async fn allocate_id(&self, id: Id, key: &K) -> Result<()> {
        let path = self.id_path(id);
        if !self
            .store
            .create_only(&path, key.as_key().as_bytes(), false)
            .await?
        {
            return Err(Error::IdConflict(id));
        }
        Ok(())
    }

    async fn allocate_id_if_locked(&self, id: Id, key: &K, lock: &dyn StoreLock) -> Result<()> {
        let path = self.id_path(id);
        if !self
            .store
            .create_only_if_locked(&path, key.as_key().as_bytes(), false, lock)
            .await?
        {
            return Err(Error::IdConflict(id));
        }
        Ok(())
    }

    async fn acquire_reference(
        &self,
        id: Id,
        key: &K,
        lock: Option<&dyn StoreLock>,
    ) -> Result<()> {
        let path = self.slave_path(&key.as_key());
        let value = id.to_string().into_bytes();
        match lock {
            Some(lock) => {
                self.store
                    .update_if_different_if_locked(&path, &value, true, lock)
                    .await?;
            }
            None => {
                self.store.update_if_different(&path, &value, true).await?;
            }
        }
        Ok(())
    }

    async fn release(&self, _id: Id, key: &K) -> Result<()> {
        let path = self.slave_path(&key.as_key());
        info!(%key, "released last local use of key, invoking global release");
        self.store.delete(&path).await?;
        Ok(())
    }

    async fn update_key(&self, id: Id, key: &K, reliably_missing: bool) -> Result<()> {
        let canonical = key.as_key();
        let master = self.id_path(id);
        let slave = self.slave_path(&canonical);

        // Create-only ensures an existing, potentially conflicting binding
        // is never overwritten.
        if self
            .store
            .create_only(&master, canonical.as_bytes(), false)
            .await?
        {
            warn!(key = %master, "re-created missing master key");
        }

        // Also restore the slave key so the next garbage-collection cycle
        // of any participating node does not remove the master key again.
        let value = id.to_string().into_bytes();
        let recreated = if reliably_missing {
            self.store.create_only(&slave, &value, true).await?
        } else {
            self.store.update_if_different(&slave, &value, true).await?
        };
        if recreated {
            warn!(key = %slave, "re-created missing slave key");
        }
        Ok(())
    }

    async fn get(&self, key: &K) -> Result<Option<Id>> {
        let prefix = self.value_path(&key.as_key());
        let pairs = self.store.list_prefix(&prefix).await?;
        Ok(Self::select_id(&prefix, &pairs))
    }

    async fn get_if_locked(&self, key: &K, lock: &dyn StoreLock) -> Result<Option<Id>> {
        let prefix = self.value_path(&key.as_key());
        let pairs = self.store.list_prefix_if_locked(&prefix, lock).await?;
        Ok(Self::select_id(&prefix, &pairs))
    }

    async fn get_by_id(&self, id: Id) -> Result<Option<K>> {
        let value = self.store.get(&self.id_path(id)).await?;
        Ok(value.map(|v| K::put_key(&String::from_utf8_lossy(&v))))
    }

    async fn lock(&self, key: &K) -> Result<Box<dyn StoreLock>> {
        Ok(self.store.lock(&self.lock_path(&key.as_key())).await?)
    }

    async fn list_ids(&self) -> Result<Vec<Id>> {
        let pairs = self.store.list_prefix(&self.id_prefix).await?;
        Ok(pairs
            .keys()
            .filter_map(|key| {
                let id = self.key_to_id(key);
                if id.is_none() {
                    warn!(%key, "cannot parse identity from master key");
                }
                id
            })
            .collect())
    }

    async fn list_and_watch(
        self: Arc<Self>,
        handler: Arc<dyn CacheMutations<K>>,
        drain: drain::Watch,
    ) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            let mut events = tokio::select! {
                _ = &mut shutdown => return,
                res = self.store.list_and_watch(&self.id_prefix) => match res {
                    Ok(events) => events,
                    Err(error) => {
                        warn!(%error, "identity watch could not be established; retrying");
                        tokio::select! {
                            _ = &mut shutdown => return,
                            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
                        }
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    event = events.next() => match event {
                        Some(event) => self.handle_event(event, &*handler),
                        None => {
                            warn!("identity watch stream ended; resynchronizing");
                            break;
                        }
                    },
                }
            }
        }
    }

    async fn run_gc(
        &self,
        limiter: &RateLimiter,
        stale_prev_round: &StaleKeys,
        min: Id,
        max: Id,
    ) -> Result<(StaleKeys, GcStats)> {
        let allocated = self.store.list_prefix(&self.id_prefix).await?;

        let total_entries = allocated.len();
        let mut deleted_entries = 0;
        let mut stale = StaleKeys::default();

        for (key, value) in &allocated {
            let id = match self.key_to_id(key) {
                Some(id) => id,
                None => {
                    warn!(%key, "unparseable identity key found, skipping");
                    continue;
                }
            };
            // Identities outside our range may belong to another allocator
            // sharing the prefix; they are never ours to reclaim.
            if id < min || id > max {
                debug!(%key, %min, %max, "skipping identity out of the local range");
                continue;
            }

            let lock = match self.store.lock(&self.lock_path(key)).await {
                Ok(lock) => lock,
                Err(error) => {
                    warn!(%error, %key, "garbage collector was unable to lock key");
                    continue;
                }
            };

            let value_prefix = self.value_path(&String::from_utf8_lossy(&value.data));
            let references = match self
                .store
                .list_prefix_if_locked(&value_prefix, &*lock)
                .await
            {
                Ok(pairs) => pairs,
                Err(error) => {
                    warn!(%error, prefix = %value_prefix, "garbage collector was unable to list references");
                    let _ = lock.unlock().await;
                    continue;
                }
            };
            let has_users = references
                .keys()
                .any(|k| prefix_matches_key(&value_prefix, k));

            let mut deleted = false;
            if !has_users {
                match stale_prev_round.get(key) {
                    // Unreferenced and unmodified since the previous cycle:
                    // safe to reap.
                    Some(&mod_revision) if mod_revision == value.mod_revision => {
                        match self.store.delete_if_locked(key, &*lock).await {
                            Ok(()) => {
                                deleted_entries += 1;
                                info!(%key, identity = %id, "deleted unused identity master key");
                            }
                            Err(error) => {
                                warn!(%error, %key, identity = %id, "unable to delete unused identity master key");
                            }
                        }
                        // Count the attempt toward the rate limit whether or
                        // not the store accepted the deletion.
                        deleted = true;
                    }
                    // First seen unreferenced, or its revision moved since
                    // the last mark: (re-)mark and revisit next cycle.
                    _ => {
                        stale.insert(key.clone(), value.mod_revision);
                    }
                }
            }

            if let Err(error) = lock.unlock().await {
                warn!(%error, %key, "garbage collector failed to release lock");
            }
            if deleted {
                // Awaiting after the delete keeps the per-key lock hold time
                // short.
                limiter.acquire().await;
            }
        }

        let stats = GcStats {
            alive: total_entries - deleted_entries,
            deleted: deleted_entries,
        };
        Ok((stale, stats))
    }

    async fn run_locks_gc(&self, stale_prev_round: &StaleLocks) -> Result<StaleLocks> {
        let allocated = self.store.list_prefix(&self.lock_prefix).await?;
        let mut stale = StaleLocks::default();

        for (key, value) in &allocated {
            let owner = LockOwner {
                mod_revision: value.mod_revision,
                lease: value.lease,
            };
            // Only delete when the same holder was already observed in the
            // previous round; an unchanged revision and lease means the
            // client has neither released nor re-acquired since.
            if stale_prev_round.get(key) == Some(&owner) {
                match self.store.delete(key).await {
                    Ok(()) => {
                        warn!(%key, lease = ?value.lease, "forcefully removed distributed lock held by a stale client");
                        continue;
                    }
                    Err(error) => {
                        warn!(%error, %key, lease = ?value.lease, "unable to remove distributed lock held by a stale client");
                    }
                }
            }
            stale.insert(key.clone(), owner);
        }

        Ok(stale)
    }

    async fn delete_all_keys(&self) -> Result<()> {
        for key in self.store.list_prefix(&self.base_prefix).await?.keys() {
            self.store.delete(key).await?;
        }
        Ok(())
    }

    fn lease_lost(&self) -> watch::Receiver<bool> {
        self.store.lease_lost()
    }
}
