//! Announcement strategies
//!
//! A strategy expands a provided root into the CIDs that should actually
//! be announced, as a lazy pull sequence. DAG traversal belongs to the
//! ingest layer; the strategies here cover the root itself and
//! caller-supplied sets.

use cid::Cid;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffer for strategy output channels
const STRATEGY_CHANNEL_CAPACITY: usize = 16;

/// Expansion from a provided root to the CIDs to announce.
///
/// The returned sequence is finite, may be produced incrementally, and
/// stops early when the token is cancelled or the receiver is dropped.
pub type Strategy = Arc<dyn Fn(CancellationToken, Cid) -> mpsc::Receiver<Cid> + Send + Sync>;

/// Announce only the root itself.
pub fn root_strategy() -> Strategy {
    Arc::new(|_cancel, root| {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 guarantees the send succeeds.
        let _ = tx.try_send(root);
        rx
    })
}

/// Announce the root plus a fixed set of CIDs, e.g. the blocks an ingest
/// pass reported for it.
pub fn fixed_strategy(cids: Vec<Cid>) -> Strategy {
    Arc::new(move |cancel, root| {
        let cids = cids.clone();
        let (tx, rx) = mpsc::channel(STRATEGY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if tx.send(root).await.is_err() {
                return;
            }
            for cid in cids {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(cid) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    })
}
