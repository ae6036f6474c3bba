//! In-process store implementation.
//!
//! A [`MemoryStore`] owns the shared state; [`MemoryStore::client`] hands
//! out per-node handles, each with its own lease. Leases never lapse on
//! their own (renewal is the store's job); a node crash is simulated with
//! [`MemoryClient::expire`], which drops every key bound to the lease and
//! fails all further operations of that client.
//!
//! Lock acquisitions materialize a lease-bound entry at the locked path, so
//! lock reclamation can observe held locks through ordinary prefix listings.

use crate::{
    Error, Event, EventStream, EventType, KeyValuePairs, LeaseId, LockToken, Result, Store,
    StoreLock, Value,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::{Mutex, MutexGuard};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Clone, Default)]
pub struct MemoryStore {
    core: Arc<Core>,
}

/// A node-scoped store handle bound to its own lease.
pub struct MemoryClient {
    core: Arc<Core>,
    lease: LeaseId,
    lost: watch::Receiver<bool>,
}

#[derive(Default)]
struct Core {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    revision: u64,
    next_lease: LeaseId,
    lock_seq: u64,
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
    /// Wakes tasks waiting for a lock entry to disappear.
    gates: HashMap<String, Arc<Notify>>,
    expired: HashSet<LeaseId>,
    lease_lost: HashMap<LeaseId, watch::Sender<bool>>,
}

struct Entry {
    data: Vec<u8>,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Event>,
}

struct MemoryLock {
    core: Arc<Core>,
    token: LockToken,
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client with a fresh lease.
    pub fn client(&self) -> MemoryClient {
        let mut state = self.core.state.lock();
        state.next_lease += 1;
        let lease = state.next_lease;
        let (tx, rx) = watch::channel(false);
        state.lease_lost.insert(lease, tx);
        MemoryClient {
            core: self.core.clone(),
            lease,
            lost: rx,
        }
    }

    /// Expires a lease: all keys bound to it are removed (with `Delete`
    /// events) and the owning client's operations fail from here on.
    pub fn expire(&self, lease: LeaseId) {
        self.core.expire(lease)
    }
}

// === impl MemoryClient ===

impl MemoryClient {
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Simulates losing this client's lease, as after a node crash or a
    /// prolonged partition from the store.
    pub fn expire(&self) {
        self.core.expire(self.lease)
    }

    /// Locks the shared state, failing if this client's lease is gone.
    fn guard(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.core.state.lock();
        if state.expired.contains(&self.lease) {
            return Err(Error::LeaseExpired);
        }
        Ok(state)
    }

    fn bind(&self, lease: bool) -> Option<LeaseId> {
        lease.then_some(self.lease)
    }
}

#[async_trait::async_trait]
impl Store for MemoryClient {
    async fn create_only(&self, key: &str, value: &[u8], lease: bool) -> Result<bool> {
        let mut state = self.guard()?;
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.upsert(key, value, self.bind(lease));
        Ok(true)
    }

    async fn create_only_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn StoreLock,
    ) -> Result<bool> {
        let mut state = self.guard()?;
        state.verify_lock(lock)?;
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.upsert(key, value, self.bind(lease));
        Ok(true)
    }

    async fn update(&self, key: &str, value: &[u8], lease: bool) -> Result<()> {
        let mut state = self.guard()?;
        state.upsert(key, value, self.bind(lease));
        Ok(())
    }

    async fn update_if_different(&self, key: &str, value: &[u8], lease: bool) -> Result<bool> {
        let mut state = self.guard()?;
        if state.is_current(key, value, self.bind(lease)) {
            return Ok(false);
        }
        state.upsert(key, value, self.bind(lease));
        Ok(true)
    }

    async fn update_if_different_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn StoreLock,
    ) -> Result<bool> {
        let mut state = self.guard()?;
        state.verify_lock(lock)?;
        if state.is_current(key, value, self.bind(lease)) {
            return Ok(false);
        }
        state.upsert(key, value, self.bind(lease));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.guard()?;
        state.remove_entry(key);
        Ok(())
    }

    async fn delete_if_locked(&self, key: &str, lock: &dyn StoreLock) -> Result<()> {
        let mut state = self.guard()?;
        state.verify_lock(lock)?;
        state.remove_entry(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.guard()?;
        Ok(state.entries.get(key).map(|e| e.data.clone()))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<KeyValuePairs> {
        let state = self.guard()?;
        Ok(state.list(prefix))
    }

    async fn list_prefix_if_locked(
        &self,
        prefix: &str,
        lock: &dyn StoreLock,
    ) -> Result<KeyValuePairs> {
        let state = self.guard()?;
        state.verify_lock(lock)?;
        Ok(state.list(prefix))
    }

    async fn list_and_watch(&self, prefix: &str) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.guard()?;
        for (key, entry) in state.range(prefix) {
            let _ = tx.send(Event {
                typ: EventType::Create,
                key: key.clone(),
                value: entry.data.clone(),
                mod_revision: entry.mod_revision,
                lease: entry.lease,
            });
        }
        let _ = tx.send(Event {
            typ: EventType::ListDone,
            key: prefix.to_string(),
            value: Vec::new(),
            mod_revision: 0,
            lease: None,
        });
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn lock(&self, path: &str) -> Result<Box<dyn StoreLock>> {
        loop {
            let gate = {
                let mut state = self.guard()?;
                if !state.entries.contains_key(path) {
                    state.lock_seq += 1;
                    let holder = format!("{:x}-{}", self.lease, state.lock_seq);
                    let rev = state.upsert(path, holder.as_bytes(), Some(self.lease));
                    return Ok(Box::new(MemoryLock {
                        core: self.core.clone(),
                        token: LockToken {
                            path: path.to_string(),
                            holder,
                            mod_revision: rev,
                        },
                    }));
                }
                state
                    .gates
                    .entry(path.to_string())
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone()
            };
            let notified = gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // The holder may have released between dropping the state lock
            // and registering interest; re-check before parking.
            if !self.core.state.lock().entries.contains_key(path) {
                continue;
            }
            notified.await;
        }
    }

    fn lease_lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }
}

// === impl Core ===

impl Core {
    fn expire(&self, lease: LeaseId) {
        let mut state = self.state.lock();
        if !state.expired.insert(lease) {
            return;
        }
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        tracing::debug!(lease, keys = doomed.len(), "lease expired, dropping bound keys");
        for key in doomed {
            state.remove_entry(&key);
        }
        if let Some(tx) = state.lease_lost.get(&lease) {
            let _ = tx.send(true);
        }
    }
}

// === impl State ===

impl State {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn range<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    fn list(&self, prefix: &str) -> KeyValuePairs {
        self.range(prefix)
            .map(|(k, e)| {
                (
                    k.clone(),
                    Value {
                        data: e.data.clone(),
                        mod_revision: e.mod_revision,
                        lease: e.lease,
                    },
                )
            })
            .collect()
    }

    /// Returns true when `key` already holds `value` under the requested
    /// lease binding, i.e. a write would be a no-op.
    fn is_current(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> bool {
        match self.entries.get(key) {
            Some(e) => e.data == value && (lease.is_none() || e.lease == lease),
            None => false,
        }
    }

    fn upsert(&mut self, key: &str, value: &[u8], lease: Option<LeaseId>) -> u64 {
        let rev = self.bump();
        let typ = if self.entries.contains_key(key) {
            EventType::Modify
        } else {
            EventType::Create
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                mod_revision: rev,
                lease,
            },
        );
        self.broadcast(Event {
            typ,
            key: key.to_string(),
            value: value.to_vec(),
            mod_revision: rev,
            lease,
        });
        rev
    }

    fn remove_entry(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        let rev = self.bump();
        self.broadcast(Event {
            typ: EventType::Delete,
            key: key.to_string(),
            value: Vec::new(),
            mod_revision: rev,
            lease: None,
        });
        if let Some(gate) = self.gates.get(key) {
            gate.notify_waiters();
        }
        true
    }

    fn broadcast(&mut self, event: Event) {
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn verify_lock(&self, lock: &dyn StoreLock) -> Result<()> {
        let token = lock.token();
        match self.entries.get(&token.path) {
            Some(e)
                if e.data == token.holder.as_bytes()
                    && e.mod_revision == token.mod_revision =>
            {
                Ok(())
            }
            _ => Err(Error::LockLost),
        }
    }
}

// === impl MemoryLock ===

impl MemoryLock {
    fn release(&self) {
        let mut state = self.core.state.lock();
        let held = matches!(
            state.entries.get(&self.token.path),
            Some(e) if e.data == self.token.holder.as_bytes()
                && e.mod_revision == self.token.mod_revision
        );
        if held {
            state.remove_entry(&self.token.path);
        }
    }
}

#[async_trait::async_trait]
impl StoreLock for MemoryLock {
    fn token(&self) -> LockToken {
        self.token.clone()
    }

    async fn unlock(self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn create_only_is_atomic() {
        let store = MemoryStore::new();
        let client = store.client();
        assert!(client.create_only("k", b"v1", false).await.unwrap());
        assert!(!client.create_only("k", b"v2", false).await.unwrap());
        assert_eq!(client.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn update_if_different_suppresses_revision_churn() {
        let store = MemoryStore::new();
        let client = store.client();
        assert!(client.update_if_different("k", b"v", false).await.unwrap());
        let rev = client.list_prefix("k").await.unwrap()["k"].mod_revision;

        assert!(!client.update_if_different("k", b"v", false).await.unwrap());
        assert_eq!(client.list_prefix("k").await.unwrap()["k"].mod_revision, rev);

        assert!(client.update_if_different("k", b"w", false).await.unwrap());
        assert_ne!(client.list_prefix("k").await.unwrap()["k"].mod_revision, rev);
    }

    #[tokio::test]
    async fn update_if_different_rebinds_foreign_lease() {
        let store = MemoryStore::new();
        let (a, b) = (store.client(), store.client());
        assert!(a.update_if_different("k", b"v", true).await.unwrap());
        // Same value, but the entry is bound to a's lease: b must rewrite it
        // so the key survives a's crash.
        assert!(b.update_if_different("k", b"v", true).await.unwrap());
        a.expire();
        assert_eq!(b.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn list_and_watch_replays_then_tails() {
        let store = MemoryStore::new();
        let client = store.client();
        client.update("p/a", b"1", false).await.unwrap();
        client.update("p/b", b"2", false).await.unwrap();
        client.update("q/c", b"3", false).await.unwrap();

        let mut events = client.list_and_watch("p/").await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let ev = events.next().await.unwrap();
            assert_eq!(ev.typ, EventType::Create);
            seen.push(ev.key);
        }
        seen.sort();
        assert_eq!(seen, vec!["p/a", "p/b"]);
        assert_eq!(events.next().await.unwrap().typ, EventType::ListDone);

        client.update("p/d", b"4", false).await.unwrap();
        client.delete("p/a").await.unwrap();
        let ev = events.next().await.unwrap();
        assert_eq!((ev.typ, ev.key.as_str()), (EventType::Create, "p/d"));
        let ev = events.next().await.unwrap();
        assert_eq!((ev.typ, ev.key.as_str()), (EventType::Delete, "p/a"));
        assert!(ev.value.is_empty());
    }

    #[tokio::test]
    async fn lock_blocks_until_released() {
        let store = MemoryStore::new();
        let held = store.client().lock("locks/x").await.unwrap();

        let contender = store.client();
        let mut pending = tokio::spawn(async move {
            let lock = contender.lock("locks/x").await.unwrap();
            lock.unlock().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished(), "lock must not be acquired twice");

        held.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), &mut pending)
            .await
            .expect("contender must acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lease_drops_keys_and_fails_operations() {
        let store = MemoryStore::new();
        let (a, b) = (store.client(), store.client());
        a.update("leased", b"v", true).await.unwrap();
        a.update("unleased", b"v", false).await.unwrap();

        let mut events = b.list_and_watch("leased").await.unwrap();
        events.next().await.unwrap(); // create
        events.next().await.unwrap(); // list-done

        let mut lost = a.lease_lost();
        assert!(!*lost.borrow());
        a.expire();

        assert_eq!(b.get("leased").await.unwrap(), None);
        assert_eq!(b.get("unleased").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(events.next().await.unwrap().typ, EventType::Delete);
        assert!(matches!(a.get("x").await, Err(Error::LeaseExpired)));
        lost.changed().await.unwrap();
        assert!(*lost.borrow());
    }

    #[tokio::test]
    async fn guarded_operations_fail_after_lock_loss() {
        let store = MemoryStore::new();
        let client = store.client();
        client.update("k", b"v", false).await.unwrap();
        let lock = client.lock("locks/k").await.unwrap();

        // A reclaimer force-deletes the lock entry out from under us.
        store.client().delete("locks/k").await.unwrap();

        assert!(matches!(
            client.delete_if_locked("k", &*lock).await,
            Err(Error::LockLost)
        ));
        assert_eq!(client.get("k").await.unwrap(), Some(b"v".to_vec()));
        lock.unlock().await.unwrap();
    }
}
