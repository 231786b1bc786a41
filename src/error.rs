//! Crate-level error type.
//!
//! Lower layers have their own error enums ([`StorageError`], [`StoreError`],
//! [`TransportError`]); [`CacheError`] is what the coordinator and its
//! building blocks return to callers.
//!
//! Only [`CacheError::StoreOpen`] and a failed cache read change what the
//! original caller observes. Commit failures are reported to the error hook
//! and otherwise stay invisible.

use thiserror::Error;

use crate::index::StorageError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors produced by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The payload store failed to open or upgrade. Caching is unavailable for
    /// the lifetime of the store.
    #[error("payload store failed to open: {0}")]
    StoreOpen(String),

    /// The key storage refused a marker write. Both marker items were removed.
    #[error("key storage quota exceeded while writing `{key}`")]
    QuotaExceeded {
        key: String,
        #[source]
        source: StorageError,
    },

    /// A declared cache hit could not be read back from the payload store.
    #[error("cached payload for `{key}` could not be read: {reason}")]
    CacheFetch { key: String, reason: String },

    /// Writing a successful response into the cache failed; the marker was
    /// rolled back.
    #[error("failed to commit `{key}` to the cache: {source}")]
    CacheCommit {
        key: String,
        #[source]
        source: Box<CacheError>,
    },

    /// A request's cache options are malformed.
    #[error("invalid cache configuration: {0}")]
    Configuration(String),

    #[error("key storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("payload store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Convenience alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;
