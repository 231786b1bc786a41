//! The cache coordinator.
//!
//! [`CacheCoordinator::execute`] sits in front of a [`Transport`] and decides,
//! per request, whether it can be answered from the cache:
//!
//! 1. Requests without `local_cache` go straight to the transport.
//! 2. Otherwise the key is derived and the [`KeyIndex`] consulted. A live
//!    marker means the body is read from the [`PayloadStore`] and a synthetic
//!    `200 success` response is returned without touching the network.
//! 3. On a miss the request is sent. A successful response is committed
//!    (marker, then payload) and returned unchanged; commit failures are
//!    logged, reported to the error hook and otherwise swallowed.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use respcache::cache::CacheCoordinator;
//! use respcache::config::CacheConfig;
//! use respcache::http::{RequestDescriptor, ResponseType};
//! use respcache::store::{MemoryBackend, PayloadStore};
//! use respcache::transport::{BinaryTransportAdapter, TcpExchange};
//!
//! # async fn run() -> Result<(), respcache::CacheError> {
//! let config = CacheConfig::default();
//! let store = PayloadStore::open(Arc::new(MemoryBackend::new()), config.store.clone());
//! let transport = BinaryTransportAdapter::over(Arc::new(TcpExchange::new()));
//!
//! let cache = CacheCoordinator::builder()
//!     .transport(Arc::new(transport))
//!     .store(store)
//!     .config(config)
//!     .build()?;
//!
//! let request = RequestDescriptor::get("http://127.0.0.1:8080/api/x")
//!     .data_type(ResponseType::Json)
//!     .local_cache(true)
//!     .cache_ttl(1.0);
//! let response = cache.execute(request).await?;
//! println!("{} {}", response.status(), response.status_text());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, MILLIS_PER_HOUR, SystemClock};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::http::{LocalCache, RequestDescriptor, Response};
use crate::index::{KeyIndex, KeyStorage, Lookup, MemoryStorage};
use crate::store::{PayloadStore, StorePhase};
use crate::transport::Transport;

mod commit;
mod key;

pub use commit::commit_entry;
pub use key::{derive_key, strip_busting_token};

/// Callback receiving errors the caller would otherwise never see.
pub type ErrorHook = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Two-tier response cache in front of a transport.
///
/// Cloning is cheap; clones share the transport, store and default storage.
#[derive(Clone)]
pub struct CacheCoordinator {
    transport: Arc<dyn Transport>,
    store: PayloadStore,
    default_storage: Arc<dyn KeyStorage>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    on_error: Option<ErrorHook>,
}

impl CacheCoordinator {
    pub fn builder() -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder::default()
    }

    /// Answers `request` from the cache or the network.
    ///
    /// # Errors
    ///
    /// Transport failures on a miss or pass-through ([`CacheError::Transport`]).
    /// A declared hit whose payload cannot be read is not an error: it yields
    /// a `500 cache failure` response.
    pub async fn execute(&self, request: RequestDescriptor) -> Result<Response, CacheError> {
        let storage = match request.local_cache_option() {
            LocalCache::Disabled => return self.pass_through(&request).await,
            LocalCache::Default => Arc::clone(&self.default_storage),
            LocalCache::Custom(storage) => Arc::clone(storage),
        };

        self.store.start();
        if self.store.phase() == StorePhase::Failed {
            warn!(url = %request.url(), "payload store unavailable, sending uncached");
            return self.pass_through(&request).await;
        }

        let index = KeyIndex::new(storage);
        let key = derive_key(&request);
        let valid = request.validity_check().is_none_or(|check| check());

        match index.lookup(&key, self.clock.now_millis(), valid) {
            Lookup::Hit(_) => match self.serve_cached(&index, &key).await {
                Some(response) => return Ok(response),
                None => return self.pass_through(&request).await,
            },
            outcome => debug!(key, ?outcome, "cache miss"),
        }

        let response = self.transport.send(&request).await?;
        if response.is_success() {
            self.commit(&index, &key, &request, &response).await;
        }
        Ok(response)
    }

    /// Empties the payload store. Markers left in key storages are harmless:
    /// a marker without a payload is served as a cache failure once and then
    /// removed.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.clear().await
    }

    pub fn store(&self) -> &PayloadStore {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Epoch milliseconds at which an entry committed at `now` expires.
    pub fn expiry_for(&self, request: &RequestDescriptor, now: i64) -> i64 {
        let hours = request
            .cache_ttl_hours()
            .filter(|hours| hours.is_finite() && *hours > 0.0)
            .unwrap_or(self.config.default_ttl_hours);
        // Float to int casts saturate.
        let ttl = (hours * MILLIS_PER_HOUR as f64).round() as i64;
        now.saturating_add(ttl)
    }

    async fn pass_through(&self, request: &RequestDescriptor) -> Result<Response, CacheError> {
        Ok(self.transport.send(request).await?)
    }

    /// Reads a declared hit. `None` means the store never opened and the
    /// request should be sent uncached.
    async fn serve_cached(&self, index: &KeyIndex, key: &str) -> Option<Response> {
        let reason = match self.store.get(key).await {
            Ok(Some(entry)) => {
                debug!(key, "cache hit");
                return Some(Response::from_cache(entry));
            }
            Ok(None) => "payload missing".to_owned(),
            Err(CacheError::StoreOpen(reason)) => {
                warn!(key, %reason, "payload store unavailable, sending uncached");
                return None;
            }
            Err(e) => e.to_string(),
        };

        let failure = CacheError::CacheFetch {
            key: key.to_owned(),
            reason,
        };
        warn!(error = %failure, "serving cache failure and dropping orphan marker");
        index.remove(key);
        Some(Response::cache_failure())
    }

    async fn commit(
        &self,
        index: &KeyIndex,
        key: &str,
        request: &RequestDescriptor,
        response: &Response,
    ) {
        let Some(payload) = response.body().cloned() else {
            debug!(key, "successful response has no body to cache");
            return;
        };
        let expires_at = self.expiry_for(request, self.clock.now_millis());

        let committed = commit_entry(
            index,
            &self.store,
            key,
            expires_at,
            payload,
            response.data_type(),
        )
        .await;

        if let (Err(e), Some(hook)) = (committed, &self.on_error) {
            hook(&e);
        }
    }
}

impl fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CacheCoordinator`]. A transport and a store are required.
#[derive(Default)]
pub struct CacheCoordinatorBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<PayloadStore>,
    default_storage: Option<Arc<dyn KeyStorage>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<CacheConfig>,
    on_error: Option<ErrorHook>,
}

impl CacheCoordinatorBuilder {
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn store(mut self, store: PayloadStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Key storage used by requests with `local_cache(true)`. Defaults to a
    /// [`MemoryStorage`] limited to `config.storage_quota_bytes`.
    #[must_use]
    pub fn default_storage(mut self, storage: Arc<dyn KeyStorage>) -> Self {
        self.default_storage = Some(storage);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Called with every [`CacheError::CacheCommit`].
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// # Errors
    ///
    /// [`CacheError::Configuration`] if the transport or store is missing, or
    /// the configuration is out of range.
    pub fn build(self) -> Result<CacheCoordinator, CacheError> {
        let transport = self
            .transport
            .ok_or_else(|| CacheError::Configuration("a transport is required".to_owned()))?;
        let store = self
            .store
            .ok_or_else(|| CacheError::Configuration("a payload store is required".to_owned()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let default_storage = self.default_storage.unwrap_or_else(|| {
            Arc::new(match config.storage_quota_bytes {
                Some(quota) => MemoryStorage::with_quota(quota),
                None => MemoryStorage::new(),
            })
        });

        Ok(CacheCoordinator {
            transport,
            store,
            default_storage,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config,
            on_error: self.on_error,
        })
    }
}
