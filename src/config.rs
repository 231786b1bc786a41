//! Cache configuration.
//!
//! Loaded from JSON (or built in code) and handed to the coordinator builder.
//!
//! ```json
//! {
//!   "default_ttl_hours": 5,
//!   "storage_quota_bytes": 5242880,
//!   "store": { "name": "respcache", "version": 1, "partition": "payloads" }
//! }
//! ```

use serde::Deserialize;

use crate::error::CacheError;

const DEFAULT_TTL_HOURS: f64 = 5.0;
const DEFAULT_STORAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_STORE_NAME: &str = "respcache";
const DEFAULT_STORE_VERSION: u32 = 1;
const DEFAULT_PARTITION: &str = "payloads";

/// Index over `stored_at` created on upgrade.
pub const STORED_AT_INDEX: &str = "stored_at";

/// Top-level cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cached response when the request gives no `cache_ttl`.
    pub default_ttl_hours: f64,
    /// Quota of the default in-memory key storage. `None` means unbounded.
    pub storage_quota_bytes: Option<usize>,
    /// Payload store layout.
    pub store: StoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: DEFAULT_TTL_HOURS,
            storage_quota_bytes: Some(DEFAULT_STORAGE_QUOTA_BYTES),
            store: StoreConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parses a JSON configuration document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// [`CacheError::Configuration`] if the document is malformed or a value
    /// is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, CacheError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CacheError::Configuration(format!("invalid cache config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), CacheError> {
        if !(self.default_ttl_hours.is_finite() && self.default_ttl_hours > 0.0) {
            return Err(CacheError::Configuration(format!(
                "default_ttl_hours must be a positive number, got {}",
                self.default_ttl_hours
            )));
        }
        if self.store.version == 0 {
            return Err(CacheError::Configuration(
                "store.version must be at least 1".to_owned(),
            ));
        }
        if self.store.name.is_empty() || self.store.partition.is_empty() {
            return Err(CacheError::Configuration(
                "store.name and store.partition must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Where and how payloads are stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database name.
    pub name: String,
    /// Schema version; opening an older database triggers the upgrade.
    pub version: u32,
    /// Partition holding payload entries.
    pub partition: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_STORE_NAME.to_owned(),
            version: DEFAULT_STORE_VERSION,
            partition: DEFAULT_PARTITION.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = CacheConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.default_ttl_hours, 5.0);
        assert_eq!(config.store.name, "respcache");
    }

    #[test]
    fn partial_store_section() {
        let config =
            CacheConfig::from_json_str(r#"{"store": {"version": 2}, "storage_quota_bytes": null}"#)
                .unwrap();
        assert_eq!(config.store.version, 2);
        assert_eq!(config.store.partition, "payloads");
        assert_eq!(config.storage_quota_bytes, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(CacheConfig::from_json_str(r#"{"default_ttl_hours": 0}"#).is_err());
        assert!(CacheConfig::from_json_str(r#"{"store": {"version": 0}}"#).is_err());
        assert!(CacheConfig::from_json_str("not json").is_err());
    }
}
