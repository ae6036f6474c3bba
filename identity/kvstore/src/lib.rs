//! Minimal key-value store contract the identity allocator relies on.
//!
//! The allocator does not assume linearizability beyond per-key atomic
//! primitives: create-if-absent, compare-and-set updates, lease-bound keys,
//! prefix listings, prefix watches and distributed locks. Any store offering
//! these can back the allocator; the [`memory`] module provides a complete
//! in-process implementation used by tests and local runs.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod memory;

pub use self::memory::{MemoryClient, MemoryStore};

use futures::Stream;
use std::{fmt, pin::Pin};
use tokio::sync::watch;

pub type Result<T> = std::result::Result<T, Error>;

/// Store failures, by recovery policy rather than by transport detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request failed mid-flight; the operation is idempotent and may
    /// be retried with backoff.
    #[error("kvstore request failed: {0}")]
    Transient(String),

    /// A guarded operation ran without the guarding lock still being held.
    #[error("distributed lock is no longer held")]
    LockLost,

    /// This client's lease expired; all keys bound to it are gone and every
    /// reference must be re-acquired through a fresh client.
    #[error("client lease has expired")]
    LeaseExpired,
}

/// Identifies the lease a key is bound to.
pub type LeaseId = u64;

/// A value returned by prefix listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub data: Vec<u8>,
    /// Store revision of the last modification of this key.
    pub mod_revision: u64,
    /// Lease the key is bound to, if any.
    pub lease: Option<LeaseId>,
}

pub type KeyValuePairs = ahash::AHashMap<String, Value>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventType {
    Create,
    Modify,
    Delete,
    /// Sentinel fired once a watch has replayed the current state of the
    /// prefix; everything after it is live.
    ListDone,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => "create".fmt(f),
            Self::Modify => "modify".fmt(f),
            Self::Delete => "delete".fmt(f),
            Self::ListDone => "list-done".fmt(f),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub typ: EventType,
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: u64,
    /// Lease the key was bound to at the time of the event, if any.
    pub lease: Option<LeaseId>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send + 'static>>;

/// Identifies a held lock so that guarded operations can verify it is still
/// held at execution time.
#[derive(Clone, Debug)]
pub struct LockToken {
    pub path: String,
    pub holder: String,
    pub mod_revision: u64,
}

/// A held distributed lock.
#[async_trait::async_trait]
pub trait StoreLock: Send + Sync {
    fn token(&self) -> LockToken;

    async fn unlock(self: Box<Self>) -> Result<()>;
}

/// Operations the allocator requires of a key-value store client.
///
/// A client is node-scoped: keys written with `lease = true` are bound to
/// the client's lease and disappear when the lease is lost. Every operation
/// may fail transiently; callers retry and re-acquire locks.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Atomically creates `key` if it does not exist. Returns false when the
    /// key was already present.
    async fn create_only(&self, key: &str, value: &[u8], lease: bool) -> Result<bool>;

    /// [`Store::create_only`], verifying `lock` is still held.
    async fn create_only_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn StoreLock,
    ) -> Result<bool>;

    /// Creates or overwrites `key`.
    async fn update(&self, key: &str, value: &[u8], lease: bool) -> Result<()>;

    /// Writes `key` only when its value differs, suppressing no-op writes so
    /// the key's modification revision is not churned. Returns true when a
    /// write happened.
    async fn update_if_different(&self, key: &str, value: &[u8], lease: bool) -> Result<bool>;

    /// [`Store::update_if_different`], verifying `lock` is still held.
    async fn update_if_different_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn StoreLock,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// [`Store::delete`], verifying `lock` is still held.
    async fn delete_if_locked(&self, key: &str, lock: &dyn StoreLock) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn list_prefix(&self, prefix: &str) -> Result<KeyValuePairs>;

    /// [`Store::list_prefix`], verifying `lock` is still held.
    async fn list_prefix_if_locked(
        &self,
        prefix: &str,
        lock: &dyn StoreLock,
    ) -> Result<KeyValuePairs>;

    /// Lists the prefix and then watches it: the stream replays the current
    /// entries as `Create` events, fires `ListDone` once, and then tails
    /// live mutations. Each subscription re-lists, so a consumer that lost
    /// its stream resynchronizes by subscribing again.
    async fn list_and_watch(&self, prefix: &str) -> Result<EventStream>;

    /// Acquires the distributed lock at `path`, blocking until it is free.
    async fn lock(&self, path: &str) -> Result<Box<dyn StoreLock>>;

    /// Observes loss of this client's lease. Flips to true at most once.
    fn lease_lost(&self) -> watch::Receiver<bool>;
}
