//! Core contracts for the cordon identity allocator.
//!
//! An *identity* is a small cluster-unique integer assigned to a label set.
//! Identities are published to a shared key-value store where every
//! participating node can resolve them; the types here define the pieces the
//! store-facing crates agree on:
//!
//! - [`Id`], the numeric identity;
//! - [`AllocatorKey`], the canonical-encoding contract for allocatable keys;
//! - [`LabelSet`], the standard key implementation over a label map;
//! - [`CacheObserver`], the subscription contract for downstream consumers
//!   (policy evaluation, datapath reconciliation, metrics).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod labels;

pub use self::labels::LabelSet;

use std::fmt;

/// A cluster-unique identity number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

// === impl Id ===

impl Id {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Canonical encoding contract for keys the allocator can assign identities
/// to.
///
/// Two keys with the same canonical encoding must be treated as the same key
/// everywhere: equality of encodings implies equality of identities. The
/// encoding is embedded in store paths, so it must never contain `/`.
pub trait AllocatorKey:
    Clone + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Returns the canonical, order-independent encoding of this key.
    fn as_key(&self) -> String;

    /// Reconstructs a key from its canonical encoding.
    ///
    /// Store-facing code treats encodings as opaque byte strings; this must
    /// accept any encoding previously produced by [`AllocatorKey::as_key`]
    /// and must not fail on foreign input (malformed portions are dropped).
    fn put_key(raw: &str) -> Self;
}

/// Receives identity-cache mutations.
///
/// Handlers must be idempotent and reentrant. Event ordering is preserved
/// per identity only; no ordering is guaranteed across identities.
pub trait CacheObserver<K>: Send + Sync + 'static {
    /// An identity was created or its key binding was observed again.
    fn on_upsert(&self, id: Id, key: &K);

    /// An identity was removed from the store. The key is unavailable when
    /// the deletion was observed for an identity that was never cached.
    fn on_delete(&self, id: Id, key: Option<&K>);

    /// Initial synchronization with the store completed. Invoked exactly
    /// once per cache, even if the underlying watch reconnects.
    fn on_list_done(&self);
}

/// Returns true iff `key` extends `prefix` by exactly one path segment, i.e.
/// `key == prefix + "/" + suffix` where `suffix` contains no further `/`.
///
/// Store listings are byte-prefix matches, so listing the references of the
/// canonical key `app=a;` also returns those of `app=a;env=b;`. The position
/// of the last `/` discriminates: only keys whose final separator sits
/// exactly at the end of the requested prefix belong to it.
pub fn prefix_matches_key(prefix: &str, key: &str) -> bool {
    key.rfind('/') == Some(prefix.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_requires_aligned_separator() {
        let prefix = "cordon/state/identities/v1/value/app=a;";
        assert!(prefix_matches_key(
            prefix,
            "cordon/state/identities/v1/value/app=a;/172.0.124.60"
        ));
        // A superset key shares the byte prefix but its last separator is
        // further right; it must not match.
        assert!(!prefix_matches_key(
            prefix,
            "cordon/state/identities/v1/value/app=a;env=b;/172.0.124.60"
        ));
        // No separator at all.
        assert!(!prefix_matches_key(prefix, prefix));
        // Separator aligned but nested suffix.
        assert!(prefix_matches_key(prefix, &format!("{prefix}/n1")));
    }

    #[test]
    fn id_parses_and_displays_as_decimal() {
        let id: Id = "1001".parse().unwrap();
        assert_eq!(id, Id::new(1001));
        assert_eq!(id.to_string(), "1001");
        assert!("".parse::<Id>().is_err());
        assert!("12x".parse::<Id>().is_err());
    }
}
