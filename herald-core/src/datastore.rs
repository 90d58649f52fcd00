//! Key-value datastore contract
//!
//! The durable queue and the tracker persist through this interface.
//! Lookups distinguish "key absent" from backend failure so the queue's
//! read cursor can skip retired ids without treating them as errors.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Buffer size for lazy query result channels
const QUERY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Datastore backend error: {0}")]
    Backend(String),
}

type Result<T> = std::result::Result<T, DatastoreError>;

/// Durable key-value store consumed by the queue and tracker.
///
/// Implementations must be safe for concurrent use. Deleting an absent
/// key is not an error.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Store `value` under `key`, overwriting any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value under `key`; `DatastoreError::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove `key`. Absent keys are ignored.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lazily stream every `(key, value)` pair whose key starts with
    /// `prefix`, in ascending key order. Dropping the receiver stops the
    /// scan.
    async fn query(&self, prefix: &str) -> Result<mpsc::Receiver<(String, Vec<u8>)>>;
}

/// Non-durable datastore backed by an ordered map.
///
/// Used in tests and as the default for nodes that have not configured a
/// data directory.
pub struct MemoryDatastore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn query(&self, prefix: &str) -> Result<mpsc::Receiver<(String, Vec<u8>)>> {
        // Snapshot the matching range so the scan does not hold the map
        // lock while consumers drain the channel.
        let matches: Vec<(String, Vec<u8>)> = {
            let entries = self.entries.read().await;
            entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for pair in matches {
                if tx.send(pair).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
