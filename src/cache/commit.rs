//! The write half of the cache: marker first, then payload.

use tracing::{debug, warn};

use crate::error::CacheError;
use crate::http::Payload;
use crate::index::KeyIndex;
use crate::store::PayloadStore;

/// Records a successful response under `key`.
///
/// The TTL marker is written before the payload so that a reader never sees
/// a marker whose payload write has not at least been attempted. If either
/// write fails the marker is removed again, leaving at most an orphaned
/// payload, which is never served without a marker.
///
/// # Errors
///
/// [`CacheError::CacheCommit`] wrapping the marker or payload failure.
pub async fn commit_entry(
    index: &KeyIndex,
    store: &PayloadStore,
    key: &str,
    expires_at: i64,
    payload: Payload,
    content_type: &str,
) -> Result<(), CacheError> {
    let written = match index.set(key, expires_at) {
        Ok(()) => store.set(key, payload, Some(content_type)).await,
        Err(e) => Err(e),
    };

    match written {
        Ok(()) => {
            debug!(key, expires_at, content_type, "cache entry committed");
            Ok(())
        }
        Err(source) => {
            index.remove(key);
            warn!(key, error = %source, "cache commit failed, marker rolled back");
            Err(CacheError::CacheCommit {
                key: key.to_owned(),
                source: Box::new(source),
            })
        }
    }
}
