//! Durable set of announced CIDs
//!
//! The reprovider walks this set to know what to re-announce; the
//! provider consults it to skip duplicates. Membership is persisted under
//! `/<name>/tracker/<cid>` so the set survives restarts.

use cid::Cid;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::content_id::parse_cid_str;
use crate::datastore::{Datastore, DatastoreError};

/// Buffer for the lazy tracking stream
const TRACKING_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

pub struct Tracker {
    name: String,
    store: Arc<dyn Datastore>,
}

impl Tracker {
    pub fn new(name: &str, store: Arc<dyn Datastore>) -> Self {
        Self {
            name: name.to_string(),
            store,
        }
    }

    fn prefix(&self) -> String {
        format!("/{}/tracker/", self.name)
    }

    fn key(&self, cid: &Cid) -> String {
        format!("{}{}", self.prefix(), cid)
    }

    /// Record `cid` as announced. Tracking an already-tracked CID is
    /// idempotent.
    pub async fn track(&self, cid: Cid) -> Result<(), TrackerError> {
        self.store.put(&self.key(&cid), Vec::new()).await?;
        Ok(())
    }

    /// Forget `cid`. Untracking an absent CID is a no-op.
    pub async fn untrack(&self, cid: Cid) -> Result<(), TrackerError> {
        self.store.delete(&self.key(&cid)).await?;
        Ok(())
    }

    pub async fn is_tracking(&self, cid: &Cid) -> Result<bool, TrackerError> {
        match self.store.get(&self.key(cid)).await {
            Ok(_) => Ok(true),
            Err(DatastoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lazily stream every tracked CID, in no promised order. Dropping
    /// the receiver stops the underlying scan. Keys that no longer parse
    /// as CIDs are logged and skipped.
    pub async fn tracking(&self) -> Result<mpsc::Receiver<Cid>, TrackerError> {
        let prefix = self.prefix();
        let mut results = self.store.query(&prefix).await?;

        let (tx, rx) = mpsc::channel(TRACKING_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some((key, _value)) = results.recv().await {
                let parsed = key
                    .strip_prefix(&prefix)
                    .ok_or_else(|| format!("key outside tracker namespace: {}", key))
                    .and_then(|suffix| {
                        parse_cid_str(suffix).map_err(|e| e.to_string())
                    });

                match parsed {
                    Ok(cid) => {
                        if tx.send(cid).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "skipping unparseable tracker record");
                    }
                }
            }
        });

        Ok(rx)
    }
}
