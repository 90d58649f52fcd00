//! Durable FIFO queue of CIDs awaiting announcement
//!
//! Every enqueued CID is persisted before the call returns, so the queue
//! survives crashes: an entry only leaves the datastore when its consumer
//! calls [`Entry::complete`]. A background delivery loop reads records in
//! id order and hands them to competing consumers over a shared channel,
//! blocking whenever no consumer is ready (backpressure onto the
//! announce pools).
//!
//! ## Persisted layout
//!
//! Records live under `/<name>/queue/<id>` with the raw CID bytes as the
//! value. Ids are decimal `u64`s assigned strictly increasing and never
//! reused within a process lifetime; after a restart the cursors are
//! rebuilt from the surviving records.

use cid::Cid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::content_id::{parse_cid, ContentIdError};
use crate::datastore::{Datastore, DatastoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Invalid queue key: {0}")]
    InvalidKey(String),

    #[error("Invalid queued CID: {0}")]
    InvalidCid(#[from] ContentIdError),
}

type Result<T> = std::result::Result<T, QueueError>;

/// A dequeued queue element bound to its persistent record.
///
/// The consumer that received the entry owns it: call [`complete`] to
/// retire the record, or drop the entry to leave it durably queued for
/// re-delivery after a restart.
///
/// [`complete`]: Entry::complete
pub struct Entry {
    cid: Cid,
    key: String,
    store: Arc<dyn Datastore>,
    completed: AtomicBool,
}

impl Entry {
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// Remove the persisted record. Completing twice is a no-op.
    pub async fn complete(&self) -> Result<()> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.delete(&self.key).await?;
        Ok(())
    }
}

/// Read cursors over the persisted id range.
///
/// `head` is the next id to attempt to read, `tail` the next id to
/// assign. `head == tail` means empty; `head` never passes `tail`.
struct Cursors {
    head: u64,
    tail: u64,
}

/// Crash-safe FIFO of CIDs persisted in a datastore.
pub struct Queue {
    name: String,
    store: Arc<dyn Datastore>,
    state: Arc<Mutex<Cursors>>,
    not_empty: Arc<Notify>,
    delivery: Arc<Mutex<mpsc::Receiver<Entry>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    /// Recover cursors from any surviving records under
    /// `/<name>/queue/` and start the delivery loop.
    pub async fn new(
        name: &str,
        store: Arc<dyn Datastore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (head, tail) = recover_cursors(name, store.as_ref()).await?;
        debug!(queue = name, head, tail, "queue recovered");

        let state = Arc::new(Mutex::new(Cursors { head, tail }));
        let not_empty = Arc::new(Notify::new());
        // Capacity 1 is tokio's closest rendering of a rendezvous
        // channel: the loop runs at most one entry ahead of consumers.
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(delivery_loop(
            name.to_string(),
            Arc::clone(&store),
            cancel,
            Arc::clone(&state),
            Arc::clone(&not_empty),
            tx,
        ));

        Ok(Self {
            name: name.to_string(),
            store,
            state,
            not_empty,
            delivery: Arc::new(Mutex::new(rx)),
            loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Persist `cid` at the tail of the queue.
    ///
    /// On a datastore error the id is not consumed and the error is
    /// returned to the caller.
    pub async fn enqueue(&self, cid: Cid) -> Result<()> {
        let mut cursors = self.state.lock().await;

        let was_empty = cursors.head == cursors.tail;
        let key = queue_key(&self.name, cursors.tail);

        self.store.put(&key, cid.to_bytes()).await?;
        cursors.tail += 1;

        if was_empty {
            // Signalled while the lock is held; `notify_one` stores a
            // permit when the loop is not yet waiting, so the wakeup
            // cannot be lost and the send cannot block.
            self.not_empty.notify_one();
        }

        Ok(())
    }

    /// Shared delivery handle. Every call returns the same receiver;
    /// consumers lock it to compete for entries, and each entry is
    /// delivered to exactly one consumer.
    pub fn dequeue(&self) -> Arc<Mutex<mpsc::Receiver<Entry>>> {
        Arc::clone(&self.delivery)
    }

    pub async fn is_empty(&self) -> bool {
        let cursors = self.state.lock().await;
        cursors.head == cursors.tail
    }

    /// Wait for the delivery loop to exit. Call after cancelling the
    /// queue's token.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn queue_prefix(name: &str) -> String {
    format!("/{}/queue/", name)
}

fn queue_key(name: &str, id: u64) -> String {
    format!("{}{}", queue_prefix(name), id)
}

/// Scan surviving records and rebuild `head`/`tail`:
/// `head = min(live id)`, `tail = 1 + max(live id)`, both zero when no
/// records exist.
async fn recover_cursors(name: &str, store: &dyn Datastore) -> Result<(u64, u64)> {
    let prefix = queue_prefix(name);
    let mut results = store.query(&prefix).await?;

    let mut head = u64::MAX;
    let mut tail: u64 = 0;

    while let Some((key, _value)) = results.recv().await {
        let id = key
            .strip_prefix(&prefix)
            .and_then(|suffix| suffix.parse::<u64>().ok())
            .ok_or_else(|| QueueError::InvalidKey(key.clone()))?;

        head = head.min(id);
        tail = tail.max(id + 1);
    }

    if head == u64::MAX {
        head = 0;
    }

    Ok((head, tail))
}

/// Background loop: wait for records, read the next one, hand it to a
/// consumer. Runs until the token is cancelled.
async fn delivery_loop(
    name: String,
    store: Arc<dyn Datastore>,
    cancel: CancellationToken,
    state: Arc<Mutex<Cursors>>,
    not_empty: Arc<Notify>,
    tx: mpsc::Sender<Entry>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let empty = {
            let cursors = state.lock().await;
            cursors.head == cursors.tail
        };
        if empty {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = not_empty.notified() => {}
            }
        }

        let entry = match next(&name, &store, &cancel, &state).await {
            Ok(Some(entry)) => entry,
            // Cancelled, or a stale wakeup found the queue empty.
            Ok(None) => continue,
            Err(e) => {
                warn!(queue = %name, error = %e, "failed to read next queue entry");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(entry) => {
                if sent.is_err() {
                    // All consumers gone
                    return;
                }
            }
        }
    }
}

/// Read the record at `head`, skipping ids whose records were already
/// retired. Holds the cursor lock for the duration so id handout stays
/// serialised with enqueue.
async fn next(
    name: &str,
    store: &Arc<dyn Datastore>,
    cancel: &CancellationToken,
    state: &Arc<Mutex<Cursors>>,
) -> Result<Option<Entry>> {
    let mut cursors = state.lock().await;

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if cursors.head == cursors.tail {
            return Ok(None);
        }

        let key = queue_key(name, cursors.head);
        match store.get(&key).await {
            // Retired id (or a recovery hole); move on.
            Err(DatastoreError::NotFound(_)) => {
                cursors.head += 1;
                continue;
            }
            // Transient failure: the cursor stays put so the record is
            // retried, not skipped.
            Err(e) => return Err(e.into()),
            Ok(value) => {
                cursors.head += 1;
                match parse_cid(&value) {
                    Ok(cid) => {
                        return Ok(Some(Entry {
                            cid,
                            key,
                            store: Arc::clone(store),
                            completed: AtomicBool::new(false),
                        }))
                    }
                    // Undecodable record: the cursor has already moved
                    // past it, so it is skipped rather than retried.
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
