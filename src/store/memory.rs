//! In-process structured store.
//!
//! Databases live for as long as the [`MemoryBackend`] does, so reopening a
//! name returns the same data. Deleting a database closes every connection to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::PayloadEntry;
use super::backend::{Backend, Connection, Opened, PartitionSchema, StoreError};

/// Index field supported by the in-memory engine.
const STORED_AT: &str = "stored_at";

/// Backend keeping every database in memory.
#[derive(Default)]
pub struct MemoryBackend {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the databases currently present.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.databases).keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Default)]
struct MemoryDatabase {
    version: Mutex<u32>,
    partitions: Mutex<HashMap<String, Partition>>,
    deleted: AtomicBool,
}

struct Partition {
    schema: PartitionSchema,
    rows: BTreeMap<String, PayloadEntry>,
    /// index name → (stored_at → keys); duplicates allowed.
    indexes: HashMap<String, BTreeMap<i64, BTreeSet<String>>>,
}

impl Partition {
    fn unindex(&mut self, entry: &PayloadEntry) {
        for index in self.indexes.values_mut() {
            if let Some(keys) = index.get_mut(&entry.stored_at) {
                keys.remove(&entry.key);
                if keys.is_empty() {
                    index.remove(&entry.stored_at);
                }
            }
        }
    }

    fn index(&mut self, entry: &PayloadEntry) {
        for index in self.indexes.values_mut() {
            index
                .entry(entry.stored_at)
                .or_default()
                .insert(entry.key.clone());
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self, name: &str, version: u32) -> Result<Opened, StoreError> {
        if version == 0 {
            return Err(StoreError::Open {
                name: name.to_owned(),
                reason: "version must be at least 1".to_owned(),
            });
        }

        let db = Arc::clone(lock(&self.databases).entry(name.to_owned()).or_default());

        let previous_version = {
            let mut current = lock(&db.version);
            if *current > version {
                return Err(StoreError::VersionTooHigh {
                    name: name.to_owned(),
                    requested: version,
                    current: *current,
                });
            }
            std::mem::replace(&mut *current, version)
        };

        Ok(Opened {
            connection: Arc::new(MemoryConnection {
                name: name.to_owned(),
                version,
                db,
                closed: AtomicBool::new(false),
            }),
            previous_version,
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), StoreError> {
        if let Some(db) = lock(&self.databases).remove(name) {
            db.deleted.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryConnection {
    name: String,
    version: u32,
    db: Arc<MemoryDatabase>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn partitions(&self) -> Result<MutexGuard<'_, HashMap<String, Partition>>, StoreError> {
        if self.closed.load(Ordering::SeqCst) || self.db.deleted.load(Ordering::SeqCst) {
            return Err(StoreError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(lock(&self.db.partitions))
    }
}

fn missing(partition: &str) -> StoreError {
    StoreError::MissingPartition {
        partition: partition.to_owned(),
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn has_partition(&self, partition: &str) -> bool {
        lock(&self.db.partitions).contains_key(partition)
    }

    async fn create_partition(&self, schema: &PartitionSchema) -> Result<(), StoreError> {
        let mut partitions = self.partitions()?;
        if partitions.contains_key(&schema.name) {
            return Err(StoreError::Constraint(format!(
                "partition `{}` already exists",
                schema.name
            )));
        }

        let mut indexes = HashMap::new();
        for index in &schema.indexes {
            if index.key_path != STORED_AT || index.unique {
                return Err(StoreError::Constraint(format!(
                    "index `{}` must be a non-unique index over `{STORED_AT}`",
                    index.name
                )));
            }
            indexes.insert(index.name.clone(), BTreeMap::new());
        }

        partitions.insert(
            schema.name.clone(),
            Partition {
                schema: schema.clone(),
                rows: BTreeMap::new(),
                indexes,
            },
        );
        Ok(())
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<PayloadEntry>, StoreError> {
        let partitions = self.partitions()?;
        let part = partitions.get(partition).ok_or_else(|| missing(partition))?;
        Ok(part.rows.get(key).cloned())
    }

    async fn put(&self, partition: &str, entry: PayloadEntry) -> Result<(), StoreError> {
        let mut partitions = self.partitions()?;
        let part = partitions
            .get_mut(partition)
            .ok_or_else(|| missing(partition))?;
        debug_assert_eq!(part.schema.key_path, "key");

        if let Some(old) = part.rows.remove(&entry.key) {
            part.unindex(&old);
        }
        part.index(&entry);
        part.rows.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
        let mut partitions = self.partitions()?;
        let part = partitions
            .get_mut(partition)
            .ok_or_else(|| missing(partition))?;
        if let Some(old) = part.rows.remove(key) {
            part.unindex(&old);
        }
        Ok(())
    }

    async fn keys_below(
        &self,
        partition: &str,
        index: &str,
        upper: i64,
    ) -> Result<Vec<String>, StoreError> {
        let partitions = self.partitions()?;
        let part = partitions.get(partition).ok_or_else(|| missing(partition))?;
        let index = part
            .indexes
            .get(index)
            .ok_or_else(|| StoreError::Constraint(format!("index `{index}` does not exist")))?;
        Ok(index
            .range(..upper)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Payload;
    use crate::store::backend::IndexSchema;

    fn schema() -> PartitionSchema {
        PartitionSchema {
            name: "payloads".to_owned(),
            key_path: "key".to_owned(),
            indexes: vec![IndexSchema {
                name: "stored_at".to_owned(),
                key_path: "stored_at".to_owned(),
                unique: false,
            }],
        }
    }

    fn entry(key: &str, stored_at: i64) -> PayloadEntry {
        PayloadEntry::new(key, stored_at, "text", Payload::Text(key.to_owned()))
    }

    #[tokio::test]
    async fn open_reports_previous_version() {
        let backend = MemoryBackend::new();
        let first = backend.open("db", 1).await.unwrap();
        assert_eq!(first.previous_version, 0);
        let again = backend.open("db", 1).await.unwrap();
        assert_eq!(again.previous_version, 1);
        let upgraded = backend.open("db", 3).await.unwrap();
        assert_eq!(upgraded.previous_version, 1);
        assert_eq!(upgraded.connection.version(), 3);
    }

    #[tokio::test]
    async fn older_version_is_refused() {
        let backend = MemoryBackend::new();
        backend.open("db", 2).await.unwrap();
        let err = backend.open("db", 1).await.err().unwrap();
        assert!(matches!(err, StoreError::VersionTooHigh { current: 2, requested: 1, .. }));
    }

    #[tokio::test]
    async fn put_overwrites_and_reindexes() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", 1).await.unwrap().connection;
        conn.create_partition(&schema()).await.unwrap();

        conn.put("payloads", entry("a", 10)).await.unwrap();
        conn.put("payloads", entry("b", 10)).await.unwrap();
        conn.put("payloads", entry("a", 30)).await.unwrap();

        assert_eq!(conn.keys_below("payloads", "stored_at", 20).await.unwrap(), vec!["b"]);
        assert_eq!(
            conn.keys_below("payloads", "stored_at", 31).await.unwrap(),
            vec!["b", "a"]
        );
        assert_eq!(conn.get("payloads", "a").await.unwrap().unwrap().stored_at, 30);
    }

    #[tokio::test]
    async fn delete_database_closes_connections() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", 1).await.unwrap().connection;
        conn.create_partition(&schema()).await.unwrap();
        conn.put("payloads", entry("a", 1)).await.unwrap();

        backend.delete_database("db").await.unwrap();
        assert!(backend.database_names().is_empty());
        assert!(matches!(
            conn.put("payloads", entry("b", 2)).await,
            Err(StoreError::Closed { .. })
        ));

        let fresh = backend.open("db", 1).await.unwrap();
        assert_eq!(fresh.previous_version, 0);
        assert!(!fresh.connection.has_partition("payloads"));
    }

    #[tokio::test]
    async fn duplicate_partition_is_a_constraint_error() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", 1).await.unwrap().connection;
        conn.create_partition(&schema()).await.unwrap();
        assert!(matches!(
            conn.create_partition(&schema()).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn missing_partition() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", 1).await.unwrap().connection;
        assert!(matches!(
            conn.get("nope", "k").await,
            Err(StoreError::MissingPartition { .. })
        ));
    }
}
