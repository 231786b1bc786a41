//! Synchronous key storage capability.
//!
//! The key index only needs three string operations from its backing store,
//! the same shape as a browser `Storage` object. Callers may plug in any
//! implementation; [`MemoryStorage`] is the default.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Errors a key storage may raise on write.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The write would exceed the storage's capacity.
    #[error("storage quota of {quota} bytes exceeded writing `{key}`")]
    QuotaExceeded { key: String, quota: usize },

    /// Any other backend failure.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A minimal synchronous string store.
pub trait KeyStorage: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Implementations with bounded capacity return
    /// [`StorageError::QuotaExceeded`] when the write does not fit.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str);
}

/// In-process key storage with an optional byte quota.
///
/// The quota counts key and value bytes of every stored item.
///
/// # Examples
///
/// ```
/// use respcache::index::{KeyStorage, MemoryStorage};
///
/// let storage = MemoryStorage::with_quota(8);
/// storage.set_item("abc", "1").unwrap();
/// assert_eq!(storage.get_item("abc").as_deref(), Some("1"));
/// assert!(storage.set_item("longer-key", "value").is_err());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    quota: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    items: HashMap<String, String>,
    used: usize,
}

impl MemoryStorage {
    /// Unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage refusing writes past `quota` bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            quota: Some(quota),
        }
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Bytes currently counted against the quota.
    pub fn used_bytes(&self) -> usize {
        self.lock().used
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic mid-write leaves the map consistent; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.lock().items.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.lock();
        let previous = state.items.get(key).map_or(0, |v| key.len() + v.len());
        let needed = state.used - previous + key.len() + value.len();

        if let Some(quota) = self.quota {
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_owned(),
                    quota,
                });
            }
        }

        state.items.insert(key.to_owned(), value.to_owned());
        state.used = needed;
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let mut state = self.lock();
        if let Some(value) = state.items.remove(key) {
            state.used -= key.len() + value.len();
        }
    }
}
