//! # respcache
//!
//! A client-side, two-tier HTTP response cache.
//!
//! A fast synchronous [`KeyIndex`](index::KeyIndex) records which requests are
//! cached and until when; a slower asynchronous
//! [`PayloadStore`](store::PayloadStore) holds the response bodies. The
//! [`CacheCoordinator`] intercepts requests, answers live entries from the
//! store without touching the network, and records successful responses on
//! the way back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use respcache::{CacheConfig, CacheCoordinator, RequestDescriptor};
//! use respcache::store::{MemoryBackend, PayloadStore};
//! use respcache::transport::{BinaryTransportAdapter, TcpExchange};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::default();
//!     let cache = CacheCoordinator::builder()
//!         .transport(Arc::new(BinaryTransportAdapter::over(Arc::new(TcpExchange::new()))))
//!         .store(PayloadStore::open(Arc::new(MemoryBackend::new()), config.store.clone()))
//!         .config(config)
//!         .build()?;
//!
//!     let request = RequestDescriptor::get("http://127.0.0.1:8080/api/x")
//!         .local_cache(true)
//!         .cache_ttl(1.0);
//!     let response = cache.execute(request).await?;
//!     println!("{} {}", response.status(), response.status_text());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod index;
pub mod store;
pub mod transport;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheCoordinator, derive_key};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use http::{LocalCache, Method, Payload, RequestDescriptor, RequestOptions, Response, ResponseType};
