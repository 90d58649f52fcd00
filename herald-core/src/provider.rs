//! Provide path: announce newly added content
//!
//! `provide` expands a root through the configured strategy and enqueues
//! whatever is not already tracked; a pool of workers drains the queue,
//! verifies each CID against the block store, announces it to the
//! routing layer, and records it in the tracker. Per-entry failures are
//! logged and swallowed so one bad CID cannot stall the pool.

use cid::Cid;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block_store::BlockStore;
use crate::queue::{Entry, Queue};
use crate::routing::{ContentRouting, RoutingError};
use crate::strategy::Strategy;
use crate::tracker::{Tracker, TrackerError};

/// Concurrent announce operations per pool
pub(crate) const ANNOUNCE_WORKER_LIMIT: usize = 8;

/// Deadline on each outbound announce call
pub(crate) const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),
}

pub struct Provider {
    cancel: CancellationToken,
    strategy: Strategy,
    tracker: Arc<Tracker>,
    queue: Arc<Queue>,
    block_store: Arc<dyn BlockStore>,
    routing: Arc<dyn ContentRouting>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Provider {
    pub fn new(
        cancel: CancellationToken,
        strategy: Strategy,
        tracker: Arc<Tracker>,
        queue: Arc<Queue>,
        block_store: Arc<dyn BlockStore>,
        routing: Arc<dyn ContentRouting>,
    ) -> Self {
        Self {
            cancel,
            strategy,
            tracker,
            queue,
            block_store,
            routing,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the announce worker pool.
    pub async fn run(&self) {
        let mut workers = self.workers.lock().await;
        for _ in 0..ANNOUNCE_WORKER_LIMIT {
            let worker = AnnounceWorker {
                cancel: self.cancel.clone(),
                delivery: self.queue.dequeue(),
                tracker: Arc::clone(&self.tracker),
                block_store: Arc::clone(&self.block_store),
                routing: Arc::clone(&self.routing),
            };
            workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Expand `root` through the strategy and durably enqueue every CID
    /// not already tracked.
    ///
    /// The first tracker or queue error is returned and the remainder of
    /// the strategy output abandoned; CIDs enqueued before the failure
    /// stay queued.
    pub async fn provide(&self, root: Cid) -> Result<(), ProviderError> {
        let mut cids = (self.strategy)(self.cancel.child_token(), root);

        loop {
            let cid = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = cids.recv() => match next {
                    Some(cid) => cid,
                    None => break,
                },
            };

            if self.tracker.is_tracking(&cid).await? {
                continue;
            }
            self.queue.enqueue(cid).await?;
        }

        Ok(())
    }

    /// Stop advertising `cid`.
    ///
    /// Queued or in-flight announcements for the CID are not scrubbed
    /// and may still fire once; the next reprovide cycle will drop it.
    pub async fn unprovide(&self, cid: Cid) -> Result<(), ProviderError> {
        self.tracker.untrack(cid).await?;
        Ok(())
    }

    /// Wait for the worker pool to exit. Call after cancelling the
    /// provider's token.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

struct AnnounceWorker {
    cancel: CancellationToken,
    delivery: Arc<Mutex<mpsc::Receiver<Entry>>>,
    tracker: Arc<Tracker>,
    block_store: Arc<dyn BlockStore>,
    routing: Arc<dyn ContentRouting>,
}

impl AnnounceWorker {
    async fn run(self) {
        loop {
            let entry = {
                let mut rx = self.delivery.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    next = rx.recv() => match next {
                        Some(entry) => entry,
                        None => return,
                    },
                }
            };
            self.handle(entry).await;
        }
    }

    async fn handle(&self, entry: Entry) {
        let cid = entry.cid();

        // Skip if already tracking: another worker or a prior run got
        // there first.
        match self.tracker.is_tracking(&cid).await {
            Err(e) => {
                warn!(%cid, error = %e, "unable to check tracking for outgoing announce");
                return;
            }
            Ok(true) => {
                complete_entry(&entry).await;
                return;
            }
            Ok(false) => {}
        }

        // Never advertise blocks we no longer hold.
        match self.block_store.has(&cid).await {
            Err(e) => {
                warn!(%cid, error = %e, "unable to check block store presence");
                return;
            }
            Ok(false) => {
                if let Err(e) = self.tracker.untrack(cid).await {
                    warn!(%cid, error = %e, "unable to untrack missing block");
                }
                complete_entry(&entry).await;
                return;
            }
            Ok(true) => {}
        }

        // A failed announce is completed, not requeued; the next
        // reprovide cycle retries it.
        if let Err(e) = announce(self.routing.as_ref(), &self.cancel, cid).await {
            warn!(%cid, error = %e, "unable to announce providing");
            complete_entry(&entry).await;
            return;
        }

        // Track before completing: if tracking fails the entry is left
        // for re-delivery and the announce repeats (at-least-once).
        if let Err(e) = self.tracker.track(cid).await {
            warn!(%cid, error = %e, "unable to track announced cid");
            return;
        }

        complete_entry(&entry).await;
    }
}

/// Announce to the world that a block is provided, bounded by
/// [`ANNOUNCE_TIMEOUT`].
pub(crate) async fn announce(
    routing: &dyn ContentRouting,
    cancel: &CancellationToken,
    cid: Cid,
) -> Result<(), RoutingError> {
    debug!(%cid, "announce start");

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(RoutingError::Unavailable),
        outcome = timeout(ANNOUNCE_TIMEOUT, routing.provide(cid, true)) => {
            match outcome {
                Ok(result) => result,
                Err(_) => Err(RoutingError::Timeout),
            }
        }
    };

    if result.is_ok() {
        debug!(%cid, "announce end");
    }
    result
}

/// Retire a processed entry, logging instead of propagating failures.
pub(crate) async fn complete_entry(entry: &Entry) {
    if let Err(e) = entry.complete().await {
        warn!(cid = %entry.cid(), error = %e, "unable to complete queue entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::{Block, MemoryBlockStore};
    use crate::content_id::block_cid;
    use crate::datastore::{Datastore, MemoryDatastore};
    use crate::strategy::{fixed_strategy, root_strategy};
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    struct RecordingRouter {
        calls: StdMutex<Vec<Cid>>,
    }

    impl RecordingRouter {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Cid> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ContentRouting for RecordingRouter {
        async fn provide(&self, cid: Cid, _broadcast: bool) -> Result<(), RoutingError> {
            self.calls.lock().unwrap().push(cid);
            Ok(())
        }
    }

    struct Fixture {
        cancel: CancellationToken,
        provider: Provider,
        tracker: Arc<Tracker>,
        queue: Arc<Queue>,
        block_store: Arc<MemoryBlockStore>,
        router: Arc<RecordingRouter>,
    }

    async fn fixture(strategy: Strategy) -> Fixture {
        let store: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let cancel = CancellationToken::new();
        let queue = Arc::new(
            Queue::new("provider", store.clone(), cancel.child_token())
                .await
                .unwrap(),
        );
        let tracker = Arc::new(Tracker::new("provider", store));
        let block_store = Arc::new(MemoryBlockStore::new());
        let router = Arc::new(RecordingRouter::new());

        let provider = Provider::new(
            cancel.child_token(),
            strategy,
            Arc::clone(&tracker),
            Arc::clone(&queue),
            block_store.clone() as Arc<dyn BlockStore>,
            router.clone() as Arc<dyn ContentRouting>,
        );

        Fixture {
            cancel,
            provider,
            tracker,
            queue,
            block_store,
            router,
        }
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_until_tracked(tracker: &Tracker, cid: &Cid, want: bool) {
        for _ in 0..200 {
            if tracker.is_tracking(cid).await.unwrap_or(false) == want {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("tracking state not reached in time");
    }

    async fn wait_until_empty(queue: &Queue) {
        for _ in 0..200 {
            if queue.is_empty().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain in time");
    }

    async fn stored_block(store: &MemoryBlockStore, data: &[u8]) -> Cid {
        let block = Block::new(data.to_vec()).unwrap();
        let cid = block.cid;
        store.put(block).await.unwrap();
        cid
    }

    #[tokio::test]
    async fn test_provide_announces_and_tracks() {
        let f = fixture(root_strategy()).await;
        let cid = stored_block(&f.block_store, b"single").await;

        f.provider.run().await;
        f.provider.provide(cid).await.unwrap();

        let router = Arc::clone(&f.router);
        wait_until(move || router.calls() == vec![cid]).await;
        wait_until_tracked(&f.tracker, &cid, true).await;
        wait_until_empty(&f.queue).await;

        f.cancel.cancel();
        f.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_provide_skips_tracked_cids() {
        let f = fixture(root_strategy()).await;
        let cid = block_cid(b"tracked already").unwrap();

        f.tracker.track(cid).await.unwrap();
        f.provider.provide(cid).await.unwrap();

        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_provide_expands_strategy_output() {
        let a = block_cid(b"dag node a").unwrap();
        let b = block_cid(b"dag node b").unwrap();
        let f = fixture(fixed_strategy(vec![a, b])).await;
        let root = block_cid(b"dag root").unwrap();

        // Workers not running: everything stays queued.
        f.provider.provide(root).await.unwrap();

        assert!(!f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_unprovide_untracks() {
        let f = fixture(root_strategy()).await;
        let cid = block_cid(b"going away").unwrap();

        f.tracker.track(cid).await.unwrap();
        f.provider.unprovide(cid).await.unwrap();

        assert!(!f.tracker.is_tracking(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_drops_missing_blocks() {
        let f = fixture(root_strategy()).await;
        // Not in the block store.
        let cid = block_cid(b"missing block").unwrap();
        f.tracker.track(cid).await.unwrap();

        f.provider.run().await;
        // Enqueue directly: provide() would skip it as tracked.
        f.queue.enqueue(cid).await.unwrap();

        wait_until_tracked(&f.tracker, &cid, false).await;
        wait_until_empty(&f.queue).await;

        assert!(f.router.calls().is_empty());

        f.cancel.cancel();
        f.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_requeued_cid_skipped_once_tracked() {
        let f = fixture(root_strategy()).await;
        let cid = stored_block(&f.block_store, b"dup").await;

        f.provider.run().await;
        f.queue.enqueue(cid).await.unwrap();

        let router = Arc::clone(&f.router);
        wait_until(move || !router.calls().is_empty()).await;
        wait_until_tracked(&f.tracker, &cid, true).await;
        wait_until_empty(&f.queue).await;

        // Tracking established: a second entry is completed without a
        // second routing call.
        f.queue.enqueue(cid).await.unwrap();
        wait_until_empty(&f.queue).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(f.router.calls(), vec![cid]);

        f.cancel.cancel();
        f.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_provide_twice_produces_no_new_calls() {
        let f = fixture(root_strategy()).await;
        let cid = stored_block(&f.block_store, b"idempotent").await;

        f.provider.run().await;
        f.provider.provide(cid).await.unwrap();

        let router = Arc::clone(&f.router);
        wait_until(move || router.calls() == vec![cid]).await;
        wait_until_tracked(&f.tracker, &cid, true).await;

        // Second provide: tracker short-circuits, nothing is enqueued.
        f.provider.provide(cid).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(f.router.calls(), vec![cid]);

        f.cancel.cancel();
        f.provider.shutdown().await;
    }
}
