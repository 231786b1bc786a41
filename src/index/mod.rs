//! Key index: the fast, synchronous tier of the cache.
//!
//! For every cached request the index holds a TTL marker: a presence flag
//! stored under the cache key and an expiry timestamp (epoch milliseconds)
//! stored under `<key>cachettl`. The index is always consulted before the
//! payload store, and it never suspends.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::CacheError;

mod storage;

pub use storage::{KeyStorage, MemoryStorage, StorageError};

/// Suffix of the item holding a key's expiry timestamp.
pub const TTL_SUFFIX: &str = "cachettl";

/// Value written under the cache key itself.
const PRESENCE_FLAG: &str = "1";

/// The expiry half of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlMarker {
    /// Epoch milliseconds after which the entry is stale. `None` means the
    /// presence flag exists without a TTL item, which never expires.
    pub expires_at: Option<i64>,
}

impl TtlMarker {
    /// A marker is expired once its timestamp is strictly before `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Outcome of checking the index for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A live marker exists; the payload store may be read.
    Hit(TtlMarker),
    /// No marker.
    Miss,
    /// The marker had expired and has been removed.
    Stale,
    /// The caller's validity check rejected the entry; the marker has been removed.
    Invalidated,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Synchronous key → TTL marker map over a [`KeyStorage`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use respcache::index::{KeyIndex, Lookup, MemoryStorage};
///
/// let index = KeyIndex::new(Arc::new(MemoryStorage::new()));
/// index.set("GET/api", 2_000).unwrap();
///
/// assert!(index.lookup("GET/api", 1_000, true).is_hit());
/// assert_eq!(index.lookup("GET/api", 2_001, true), Lookup::Stale);
/// assert_eq!(index.has("GET/api"), None);
/// ```
#[derive(Clone)]
pub struct KeyIndex {
    storage: Arc<dyn KeyStorage>,
}

impl KeyIndex {
    pub fn new(storage: Arc<dyn KeyStorage>) -> Self {
        Self { storage }
    }

    /// Returns the marker for `key` if its presence flag is set.
    ///
    /// A TTL item that does not parse as a timestamp yields a marker that is
    /// already expired.
    pub fn has(&self, key: &str) -> Option<TtlMarker> {
        self.storage.get_item(key)?;
        Some(TtlMarker {
            expires_at: self.read_ttl(key),
        })
    }

    /// Writes the presence flag and the expiry timestamp for `key`.
    ///
    /// # Errors
    ///
    /// If either write fails, both items are removed and
    /// [`CacheError::QuotaExceeded`] (or [`CacheError::Storage`] for other
    /// backend failures) is returned.
    pub fn set(&self, key: &str, expires_at: i64) -> Result<(), CacheError> {
        let result = self
            .storage
            .set_item(key, PRESENCE_FLAG)
            .and_then(|()| {
                self.storage
                    .set_item(&ttl_key(key), &expires_at.to_string())
            });

        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!(key, error = %source, "marker write failed, removing partial marker");
                self.remove(key);
                Err(match source {
                    StorageError::QuotaExceeded { .. } => CacheError::QuotaExceeded {
                        key: key.to_owned(),
                        source,
                    },
                    other => CacheError::Storage(other),
                })
            }
        }
    }

    /// Removes both marker items for `key`.
    pub fn remove(&self, key: &str) {
        self.storage.remove_item(key);
        self.storage.remove_item(&ttl_key(key));
    }

    /// Decides whether `key` is servable at `now`.
    ///
    /// `valid` is the result of the caller's validity check (`true` when none
    /// was supplied). Invalidated and expired markers are removed here, so a
    /// later commit starts from a clean slate.
    pub fn lookup(&self, key: &str, now: i64, valid: bool) -> Lookup {
        if !valid {
            debug!(key, "validity check rejected cache entry");
            self.remove(key);
            return Lookup::Invalidated;
        }

        let expires_at = self.read_ttl(key);
        if expires_at.is_some_and(|at| at < now) {
            debug!(key, ?expires_at, now, "cache entry expired");
            self.remove(key);
            return Lookup::Stale;
        }

        match self.storage.get_item(key) {
            Some(_) => Lookup::Hit(TtlMarker { expires_at }),
            None => Lookup::Miss,
        }
    }

    fn read_ttl(&self, key: &str) -> Option<i64> {
        let raw = self.storage.get_item(&ttl_key(key))?;
        Some(raw.trim().parse().unwrap_or(i64::MIN))
    }
}

fn ttl_key(key: &str) -> String {
    format!("{key}{TTL_SUFFIX}")
}
