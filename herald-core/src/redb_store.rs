//! Persistent datastore backed by redb
//!
//! Single-table embedded store so queue and tracker records survive
//! process restarts. Writes commit before `put`/`delete` return, which is
//! what makes the queue's enqueue crash-safe.

use async_trait::async_trait;
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::datastore::{Datastore, DatastoreError};

const DATASTORE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("datastore");

/// Buffer size for lazy query result channels
const QUERY_CHANNEL_CAPACITY: usize = 16;

type Result<T> = std::result::Result<T, DatastoreError>;

fn backend_err(e: impl std::fmt::Display) -> DatastoreError {
    DatastoreError::Backend(e.to_string())
}

/// Durable `Datastore` over a single redb database file.
pub struct RedbDatastore {
    db: Arc<Database>,
}

impl RedbDatastore {
    /// Open (or create) the database at `path` and ensure the table
    /// exists so later read transactions do not fail on a fresh file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(backend_err)?;

        let write_txn = db.begin_write().map_err(backend_err)?;
        {
            write_txn.open_table(DATASTORE_TABLE).map_err(backend_err)?;
        }
        write_txn.commit().map_err(backend_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl Datastore for RedbDatastore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut table = write_txn.open_table(DATASTORE_TABLE).map_err(backend_err)?;
            table
                .insert(key, value.as_slice())
                .map_err(backend_err)?;
        }
        write_txn.commit().map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let read_txn = self.db.begin_read().map_err(backend_err)?;
        let table = read_txn.open_table(DATASTORE_TABLE).map_err(backend_err)?;

        match table.get(key).map_err(backend_err)? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(DatastoreError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut table = write_txn.open_table(DATASTORE_TABLE).map_err(backend_err)?;
            table.remove(key).map_err(backend_err)?;
        }
        write_txn.commit().map_err(backend_err)?;
        Ok(())
    }

    async fn query(&self, prefix: &str) -> Result<mpsc::Receiver<(String, Vec<u8>)>> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_string();
        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);

        // The scan holds a read transaction for its duration; run it off
        // the async executor and feed results through the channel.
        tokio::task::spawn_blocking(move || {
            let read_txn = match db.begin_read() {
                Ok(txn) => txn,
                Err(e) => {
                    warn!(error = %e, "redb query: failed to begin read transaction");
                    return;
                }
            };
            let table = match read_txn.open_table(DATASTORE_TABLE) {
                Ok(table) => table,
                Err(e) => {
                    warn!(error = %e, "redb query: failed to open table");
                    return;
                }
            };
            let range = match table.range(prefix.as_str()..) {
                Ok(range) => range,
                Err(e) => {
                    warn!(error = %e, "redb query: range scan failed");
                    return;
                }
            };

            for item in range {
                let (key_guard, value_guard) = match item {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "redb query: scan aborted");
                        return;
                    }
                };
                let key = key_guard.value().to_string();
                if !key.starts_with(&prefix) {
                    break;
                }
                let value = value_guard.value().to_vec();
                if tx.blocking_send((key, value)).is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
