//! Structured async store capability.
//!
//! The payload store is written against these two traits rather than a
//! concrete engine. A [`Backend`] opens named, versioned databases and can
//! delete them; a [`Connection`] is one opened database holding partitions
//! (keyed by a primary key field) with optional non-unique secondary indexes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::PayloadEntry;

/// Errors raised by a structured store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database `{name}`: {reason}")]
    Open { name: String, reason: String },

    #[error("database `{name}` is at version {current}, newer than requested version {requested}")]
    VersionTooHigh {
        name: String,
        requested: u32,
        current: u32,
    },

    #[error("connection to `{name}` is closed")]
    Closed { name: String },

    #[error("partition `{partition}` does not exist")]
    MissingPartition { partition: String },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// A secondary index declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    /// Entry field the index is built over.
    pub key_path: String,
    pub unique: bool,
}

/// A partition declaration: its name, primary key field and indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSchema {
    pub name: String,
    pub key_path: String,
    pub indexes: Vec<IndexSchema>,
}

/// Result of opening a database.
pub struct Opened {
    pub connection: Arc<dyn Connection>,
    /// Version the database had before this open; `0` when it was just created.
    pub previous_version: u32,
}

/// Opens and deletes databases.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens `name` at `version`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`StoreError::VersionTooHigh`] if the database already exists at a
    /// newer version; [`StoreError::Open`] for any other failure.
    async fn open(&self, name: &str, version: u32) -> Result<Opened, StoreError>;

    /// Deletes `name` and everything in it. Open connections become closed.
    async fn delete_database(&self, name: &str) -> Result<(), StoreError>;
}

/// One open database.
#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn has_partition(&self, partition: &str) -> bool;

    /// Creates a partition with its indexes. Fails if it already exists.
    async fn create_partition(&self, schema: &PartitionSchema) -> Result<(), StoreError>;

    async fn get(&self, partition: &str, key: &str) -> Result<Option<PayloadEntry>, StoreError>;

    /// Inserts or overwrites the entry stored under `entry.key`.
    async fn put(&self, partition: &str, entry: PayloadEntry) -> Result<(), StoreError>;

    async fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError>;

    /// Primary keys whose `index` value is strictly below `upper`, in index order.
    async fn keys_below(
        &self,
        partition: &str,
        index: &str,
        upper: i64,
    ) -> Result<Vec<String>, StoreError>;

    /// Closes the connection. Later operations fail with [`StoreError::Closed`].
    fn close(&self);
}
