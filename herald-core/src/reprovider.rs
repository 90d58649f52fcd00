//! Reprovide path: keep routing-table entries fresh
//!
//! On a periodic tick or an external trigger, every tracked CID is
//! re-enqueued and re-announced by the reprovider's own worker pool.
//! Trigger requests are serialised through a single channel; while a
//! reprovision is in flight, further triggers are answered with
//! [`ReproviderError::AlreadyRunning`] so callers can tell a concurrent
//! request from success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block_store::BlockStore;
use crate::provider::{announce, complete_entry, ANNOUNCE_WORKER_LIMIT};
use crate::queue::{Entry, Queue};
use crate::routing::ContentRouting;
use crate::tracker::{Tracker, TrackerError};

/// Grace period before the first reprovision, so short-lived processes
/// do not spam the routing layer on the way down.
const INITIAL_REPROVIDE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ReproviderError {
    #[error("reprovider is already running")]
    AlreadyRunning,

    #[error("Reprovider cancelled")]
    Cancelled,

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

/// Callback invoked with the outcome of the reprovision a trigger
/// requested.
type DoneFunc = Box<dyn FnOnce(Result<(), ReproviderError>) + Send>;

pub struct Reprovider {
    cancel: CancellationToken,
    queue: Arc<Queue>,
    tracker: Arc<Tracker>,
    tick: Duration,
    block_store: Arc<dyn BlockStore>,
    routing: Arc<dyn ContentRouting>,
    trigger_tx: mpsc::Sender<DoneFunc>,
    trigger_rx: Mutex<Option<mpsc::Receiver<DoneFunc>>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reprovider {
    /// `tick` of zero disables periodic reprovision; `trigger` remains
    /// available.
    pub fn new(
        cancel: CancellationToken,
        queue: Arc<Queue>,
        tracker: Arc<Tracker>,
        tick: Duration,
        block_store: Arc<dyn BlockStore>,
        routing: Arc<dyn ContentRouting>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            cancel,
            queue,
            tracker,
            tick,
            block_store,
            routing,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the trigger loop and the announce worker pool.
    pub async fn run(&self) {
        let mut tasks = self.tasks.lock().await;

        if let Some(trigger_rx) = self.trigger_rx.lock().await.take() {
            let trigger_loop = TriggerLoop {
                cancel: self.cancel.clone(),
                queue: Arc::clone(&self.queue),
                tracker: Arc::clone(&self.tracker),
                tick: self.tick,
                running: Arc::clone(&self.running),
            };
            tasks.push(tokio::spawn(trigger_loop.run(trigger_rx)));
        }

        for _ in 0..ANNOUNCE_WORKER_LIMIT {
            let worker = ReannounceWorker {
                cancel: self.cancel.clone(),
                delivery: self.queue.dequeue(),
                tracker: Arc::clone(&self.tracker),
                block_store: Arc::clone(&self.block_store),
                routing: Arc::clone(&self.routing),
            };
            tasks.push(tokio::spawn(worker.run()));
        }
    }

    /// Enqueue every tracked CID for re-announcement. Per-CID enqueue
    /// failures are logged and skipped.
    pub async fn reprovide(&self) -> Result<(), ReproviderError> {
        reprovide_pass(&self.queue, &self.tracker, &self.cancel).await
    }

    /// Request a reprovision and wait for it to finish.
    ///
    /// Returns [`ReproviderError::AlreadyRunning`] while another
    /// reprovision is in progress. Dropping the returned future abandons
    /// the wait, as does cancellation of the reprovider itself.
    pub async fn trigger(&self) -> Result<(), ReproviderError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ReproviderError::AlreadyRunning);
        }

        let (tx, rx) = oneshot::channel();
        let done: DoneFunc = Box::new(move |result| {
            let _ = tx.send(result);
        });

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ReproviderError::Cancelled),
            sent = self.trigger_tx.send(done) => {
                if sent.is_err() {
                    return Err(ReproviderError::Cancelled);
                }
            }
        }

        match rx.await {
            Ok(result) => result,
            // Trigger loop exited without answering.
            Err(_) => Err(ReproviderError::Cancelled),
        }
    }

    /// Wait for the trigger loop and worker pool to exit. Call after
    /// cancelling the reprovider's token.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
    }
}

struct TriggerLoop {
    cancel: CancellationToken,
    queue: Arc<Queue>,
    tracker: Arc<Tracker>,
    tick: Duration,
    running: Arc<AtomicBool>,
}

impl TriggerLoop {
    async fn run(self, mut trigger_rx: mpsc::Receiver<DoneFunc>) {
        let mut next_tick = Instant::now() + INITIAL_REPROVIDE_DELAY;

        loop {
            let done: Option<DoneFunc> = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = trigger_rx.recv() => match received {
                    Some(done) => Some(done),
                    None => return,
                },
                _ = tokio::time::sleep_until(next_tick), if !self.tick.is_zero() => None,
            };

            self.running.store(true, Ordering::SeqCst);

            let result = reprovide_pass(&self.queue, &self.tracker, &self.cancel).await;
            match done {
                Some(done) => done(result),
                None => {
                    if let Err(e) = result {
                        debug!(error = %e, "scheduled reprovide failed");
                    }
                }
            }

            // Triggers that raced past the running flag before it was
            // set are waiting in the channel; answer them now.
            while let Ok(raced) = trigger_rx.try_recv() {
                raced(Err(ReproviderError::AlreadyRunning));
            }

            self.running.store(false, Ordering::SeqCst);
            next_tick = Instant::now() + self.tick;
        }
    }
}

async fn reprovide_pass(
    queue: &Queue,
    tracker: &Tracker,
    cancel: &CancellationToken,
) -> Result<(), ReproviderError> {
    let mut cids = tracker.tracking().await?;

    loop {
        let cid = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = cids.recv() => match next {
                Some(cid) => cid,
                None => break,
            },
        };

        if let Err(e) = queue.enqueue(cid).await {
            warn!(%cid, error = %e, "unable to enqueue cid for reprovide");
            continue;
        }
    }

    Ok(())
}

/// Re-announcement worker: the provide state machine without the
/// tracked-skip step, since everything here is tracked by construction.
struct ReannounceWorker {
    cancel: CancellationToken,
    delivery: Arc<Mutex<mpsc::Receiver<Entry>>>,
    tracker: Arc<Tracker>,
    block_store: Arc<dyn BlockStore>,
    routing: Arc<dyn ContentRouting>,
}

impl ReannounceWorker {
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

        if let Err(e) = announce(self.routing.as_ref(), &self.cancel, cid).await {
            warn!(%cid, error = %e, "unable to announce providing");
            complete_entry(&entry).await;
            return;
        }

        // Idempotent refresh.
        if let Err(e) = self.tracker.track(cid).await {
            warn!(%cid, error = %e, "unable to track reprovided cid");
            return;
        }

        complete_entry(&entry).await;
    }
}
