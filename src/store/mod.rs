//! Payload store: the slow, asynchronous tier of the cache.
//!
//! Holds the actual response bodies, keyed by cache key, in a structured
//! store reached through a [`Backend`]. The store owns its connection and
//! models its lifecycle as an explicit state machine:
//!
//! ```text
//! Unopened ──start──▶ Opening ──▶ Ready
//!                        │  ▲        │
//!                        ▼  └─clear──┘
//!                      Failed
//! ```
//!
//! Every operation first waits for the store to leave `Opening`, so work
//! issued while the database is still opening (or being recreated by
//! [`PayloadStore::clear`]) is queued rather than rejected.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{STORED_AT_INDEX, StoreConfig};
use crate::error::CacheError;
use crate::http::Payload;

pub mod backend;
pub mod memory;

pub use backend::{Backend, Connection, IndexSchema, Opened, PartitionSchema, StoreError};
pub use memory::MemoryBackend;

/// A stored response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEntry {
    /// Cache key; the partition's primary key.
    pub key: String,
    /// Write time in epoch milliseconds. Ordering only; expiry lives in the key index.
    pub stored_at: i64,
    /// Declared type the body is served under.
    pub content_type: String,
    pub body: Payload,
}

impl PayloadEntry {
    pub fn new(
        key: impl Into<String>,
        stored_at: i64,
        content_type: impl Into<String>,
        body: Payload,
    ) -> Self {
        Self {
            key: key.into(),
            stored_at,
            content_type: content_type.into(),
            body,
        }
    }
}

/// Lifecycle phase of a [`PayloadStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Unopened,
    Opening,
    Ready,
    Failed,
}

enum StoreState {
    Unopened,
    Opening,
    Ready(Arc<dyn Connection>),
    Failed(String),
}

impl StoreState {
    fn phase(&self) -> StorePhase {
        match self {
            Self::Unopened => StorePhase::Unopened,
            Self::Opening => StorePhase::Opening,
            Self::Ready(_) => StorePhase::Ready,
            Self::Failed(_) => StorePhase::Failed,
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed(_))
    }
}

/// Asynchronous key → [`PayloadEntry`] store.
///
/// Cheap to clone; clones share one connection and one lifecycle.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use respcache::config::StoreConfig;
/// use respcache::http::Payload;
/// use respcache::store::{MemoryBackend, PayloadStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), respcache::CacheError> {
/// let store = PayloadStore::open(Arc::new(MemoryBackend::new()), StoreConfig::default());
/// store.set("GET/api", Payload::Text("hello".into()), Some("text")).await?;
///
/// let entry = store.get("GET/api").await?.expect("just stored");
/// assert_eq!(entry.content_type, "text");
///
/// store.clear().await?;
/// assert!(store.get("GET/api").await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PayloadStore {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    state: watch::Sender<StoreState>,
    /// Bumped by every clear; an open that started in an older generation
    /// must not publish its connection.
    generation: AtomicU64,
}

impl PayloadStore {
    /// Creates an unopened store. The first operation (or [`start`](Self::start))
    /// begins opening it.
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new), stamping entries with `clock`.
    pub fn with_clock(backend: Arc<dyn Backend>, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(StoreState::Unopened);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                clock,
                state,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a store and immediately starts opening it in the background.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        let store = Self::new(backend, config);
        store.start();
        store
    }

    /// Begins opening the database if nobody has yet. Idempotent.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let claimed = self.inner.state.send_if_modified(|state| {
            if matches!(state, StoreState::Unopened) {
                *state = StoreState::Opening;
                true
            } else {
                false
            }
        });

        if claimed {
            let inner = Arc::clone(&self.inner);
            let generation = inner.generation.load(Ordering::SeqCst);
            tokio::spawn(async move {
                // Failures are published as the Failed state.
                let _ = inner.open_database(generation).await;
            });
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> StorePhase {
        self.inner.state.borrow().phase()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Waits until the store is open.
    ///
    /// # Errors
    ///
    /// [`CacheError::StoreOpen`] if opening failed; callers can use this to
    /// fall back to uncached behaviour.
    pub async fn ready(&self) -> Result<(), CacheError> {
        self.connection().await.map(|_| ())
    }

    /// Reads the entry stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<PayloadEntry>, CacheError> {
        let conn = self.connection().await?;
        let entry = conn.get(&self.inner.config.partition, key).await?;
        debug!(key, found = entry.is_some(), "payload read");
        Ok(entry)
    }

    /// Stores `body` under `key`, overwriting any previous entry.
    ///
    /// `content_type` defaults to the payload's runtime type tag.
    pub async fn set(
        &self,
        key: &str,
        body: Payload,
        content_type: Option<&str>,
    ) -> Result<(), CacheError> {
        let content_type = content_type.unwrap_or(body.type_tag()).to_owned();
        let entry = PayloadEntry::new(key, self.inner.clock.now_millis(), content_type, body);

        let conn = self.connection().await?;
        conn.put(&self.inner.config.partition, entry).await?;
        debug!(key, "payload stored");
        Ok(())
    }

    /// Removes the entry stored under `key`.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let conn = self.connection().await?;
        conn.delete(&self.inner.config.partition, key).await?;
        Ok(())
    }

    /// Keys of entries stored strictly before `timestamp`, oldest first.
    pub async fn keys_stored_before(&self, timestamp: i64) -> Result<Vec<String>, CacheError> {
        let conn = self.connection().await?;
        let keys = conn
            .keys_below(&self.inner.config.partition, STORED_AT_INDEX, timestamp)
            .await?;
        Ok(keys)
    }

    /// Deletes the whole database and recreates it empty.
    ///
    /// Operations issued while the clear is in progress wait for the fresh
    /// database. The previous connection is closed, so writes still holding
    /// it fail instead of landing in the new structure. Resolves once the new
    /// database is open.
    ///
    /// # Errors
    ///
    /// The deletion error if the database could not be deleted (the store is
    /// reopened regardless), or [`CacheError::StoreOpen`] if recreating it failed.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.inner.state.send_replace(StoreState::Opening);
        if let StoreState::Ready(conn) = &previous {
            conn.close();
        }
        drop(previous);

        let deleted = self
            .inner
            .backend
            .delete_database(&self.inner.config.name)
            .await;
        if let Err(e) = &deleted {
            warn!(database = %self.inner.config.name, error = %e, "failed to delete payload database");
        }

        let reopened = self.inner.open_database(generation).await;
        deleted?;
        reopened?;
        info!(database = %self.inner.config.name, "payload store cleared");
        Ok(())
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>, CacheError> {
        self.start();
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(StoreState::is_settled)
            .await
            .map_err(|_| CacheError::StoreOpen("payload store shut down".to_owned()))?;

        match &*state {
            StoreState::Ready(conn) => Ok(Arc::clone(conn)),
            StoreState::Failed(reason) => Err(CacheError::StoreOpen(reason.clone())),
            StoreState::Unopened | StoreState::Opening => Err(CacheError::StoreOpen(
                "payload store is not open".to_owned(),
            )),
        }
    }
}

impl fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadStore")
            .field("config", &self.inner.config)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Inner {
    /// Opens (and if needed upgrades) the database, then publishes the outcome
    /// unless a clear has started since `generation`.
    async fn open_database(&self, generation: u64) -> Result<(), CacheError> {
        let outcome = self.open_and_upgrade().await;

        if self.generation.load(Ordering::SeqCst) != generation {
            if let Ok(conn) = &outcome {
                conn.close();
            }
            debug!(database = %self.config.name, "discarding open superseded by clear");
            return Ok(());
        }

        match outcome {
            Ok(conn) => {
                info!(database = %self.config.name, version = conn.version(), "payload store ready");
                self.state.send_replace(StoreState::Ready(conn));
                Ok(())
            }
            Err(e) => {
                warn!(database = %self.config.name, error = %e, "payload store failed to open, caching disabled");
                let reason = e.to_string();
                self.state.send_replace(StoreState::Failed(reason.clone()));
                Err(CacheError::StoreOpen(reason))
            }
        }
    }

    async fn open_and_upgrade(&self) -> Result<Arc<dyn Connection>, StoreError> {
        let Opened {
            connection,
            previous_version,
        } = self
            .backend
            .open(&self.config.name, self.config.version)
            .await?;

        if previous_version < self.config.version {
            if let Err(e) = self.upgrade(connection.as_ref(), previous_version).await {
                connection.close();
                return Err(e);
            }
        }
        Ok(connection)
    }

    async fn upgrade(&self, conn: &dyn Connection, from: u32) -> Result<(), StoreError> {
        info!(database = %self.config.name, from, to = self.config.version, "upgrading payload store");
        if conn.has_partition(&self.config.partition) {
            return Ok(());
        }
        conn.create_partition(&PartitionSchema {
            name: self.config.partition.clone(),
            key_path: "key".to_owned(),
            indexes: vec![IndexSchema {
                name: STORED_AT_INDEX.to_owned(),
                key_path: STORED_AT_INDEX.to_owned(),
                unique: false,
            }],
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::Notify;

    fn store() -> PayloadStore {
        PayloadStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    /// Backend whose `open` waits for a signal, then delegates.
    struct GatedBackend {
        gate: Arc<Notify>,
        inner: MemoryBackend,
    }

    #[async_trait]
    impl Backend for GatedBackend {
        async fn open(&self, name: &str, version: u32) -> Result<Opened, StoreError> {
            self.gate.notified().await;
            self.inner.open(name, version).await
        }

        async fn delete_database(&self, name: &str) -> Result<(), StoreError> {
            self.inner.delete_database(name).await
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl Backend for BrokenBackend {
        async fn open(&self, name: &str, _version: u32) -> Result<Opened, StoreError> {
            Err(StoreError::Open {
                name: name.to_owned(),
                reason: "storage denied".to_owned(),
            })
        }

        async fn delete_database(&self, _name: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn round_trips_every_payload_kind() {
        let store = store();
        let cases = [
            ("text", Payload::Text("plain".to_owned()), "text"),
            ("json", Payload::Json(json!({"a": 1, "b": [true, null]})), "json"),
            ("bin", Payload::Binary(Bytes::from_static(&[0, 159, 146, 150, 255])), "blob"),
        ];
        for (key, body, ty) in cases {
            store.set(key, body.clone(), Some(ty)).await.unwrap();
            let entry = store.get(key).await.unwrap().unwrap();
            assert_eq!(entry.body, body);
            assert_eq!(entry.content_type, ty);
        }
    }

    #[tokio::test]
    async fn content_type_defaults_to_type_tag() {
        let store = store();
        store.set("k", Payload::Json(json!([1])), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().content_type, "object");
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = store();
        store.set("k", Payload::Text("one".into()), None).await.unwrap();
        store.set("k", Payload::Text("two".into()), None).await.unwrap();
        assert_eq!(
            store.get("k").await.unwrap().unwrap().body,
            Payload::Text("two".into())
        );
    }

    #[tokio::test]
    async fn remove_and_missing() {
        let store = store();
        store.set("k", Payload::Text("v".into()), None).await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        store.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn operations_queue_until_open_completes() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(GatedBackend {
            gate: gate.clone(),
            inner: MemoryBackend::new(),
        });
        let store = PayloadStore::open(backend, StoreConfig::default());
        assert_eq!(store.phase(), StorePhase::Opening);

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.set("k", Payload::Text("queued".into()), None).await })
        };
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        gate.notify_one();
        writer.await.unwrap().unwrap();
        assert_eq!(store.phase(), StorePhase::Ready);
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_open_is_reported_to_every_operation() {
        let store = PayloadStore::open(Arc::new(BrokenBackend), StoreConfig::default());
        assert!(matches!(store.ready().await, Err(CacheError::StoreOpen(_))));
        assert_eq!(store.phase(), StorePhase::Failed);
        assert!(matches!(store.get("k").await, Err(CacheError::StoreOpen(_))));
    }

    #[tokio::test]
    async fn clear_drops_everything_and_reopens() {
        let store = store();
        store.set("a", Payload::Text("1".into()), None).await.unwrap();
        store.set("b", Payload::Text("2".into()), None).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.phase(), StorePhase::Ready);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_none());

        store.set("a", Payload::Text("3".into()), None).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_connection_cannot_write_into_fresh_database() {
        let store = store();
        store.ready().await.unwrap();
        let stale = store.connection().await.unwrap();

        store.clear().await.unwrap();

        let entry = PayloadEntry::new("ghost", 0, "text", Payload::Text("boo".into()));
        assert!(matches!(
            stale.put(&store.config().partition, entry).await,
            Err(StoreError::Closed { .. })
        ));
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_before_first_open() {
        let store = store();
        assert_eq!(store.phase(), StorePhase::Unopened);
        store.clear().await.unwrap();
        assert_eq!(store.phase(), StorePhase::Ready);
    }

    #[tokio::test]
    async fn secondary_index_orders_by_stored_at() {
        let clock = Arc::new(ManualClock::new(100));
        let store = PayloadStore::with_clock(
            Arc::new(MemoryBackend::new()),
            StoreConfig::default(),
            clock.clone(),
        );
        store.set("old", Payload::Text("o".into()), None).await.unwrap();
        clock.set(200);
        store.set("new", Payload::Text("n".into()), None).await.unwrap();

        assert_eq!(store.keys_stored_before(150).await.unwrap(), vec!["old"]);
        assert_eq!(store.keys_stored_before(201).await.unwrap(), vec!["old", "new"]);
    }

    #[tokio::test]
    async fn reopening_existing_database_keeps_data() {
        let backend = Arc::new(MemoryBackend::new());
        let first = PayloadStore::new(backend.clone(), StoreConfig::default());
        first.set("k", Payload::Text("v".into()), None).await.unwrap();

        let second = PayloadStore::new(backend, StoreConfig::default());
        assert!(second.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn newer_database_version_fails_open() {
        let backend = Arc::new(MemoryBackend::new());
        let newer = StoreConfig {
            version: 2,
            ..StoreConfig::default()
        };
        PayloadStore::new(backend.clone(), newer).ready().await.unwrap();

        let older = PayloadStore::new(backend, StoreConfig::default());
        assert!(matches!(older.ready().await, Err(CacheError::StoreOpen(_))));
    }
}
