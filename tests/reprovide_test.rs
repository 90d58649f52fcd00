//! End-to-end tests for the reprovide path
//!
//! Covers the periodic cycle, the synchronous trigger, and the
//! serialisation of concurrent triggers.

use async_trait::async_trait;
use cid::Cid;
use herald_core::{
    root_strategy, Block, BlockStore, ContentRouting, Datastore, DatastoreError,
    MemoryBlockStore, MemoryDatastore, Node, ReproviderError, RoutingError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

struct RecordingRouter {
    calls: Mutex<Vec<Cid>>,
}

impl RecordingRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Cid> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentRouting for RecordingRouter {
    async fn provide(&self, cid: Cid, _broadcast: bool) -> Result<(), RoutingError> {
        self.calls.lock().unwrap().push(cid);
        Ok(())
    }
}

/// Datastore that feeds prefix scans slowly, stretching the reprovide
/// window so concurrent triggers can be observed.
struct SlowScanStore {
    inner: MemoryDatastore,
    scan_delay: Duration,
}

#[async_trait]
impl Datastore for SlowScanStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DatastoreError> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, DatastoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), DatastoreError> {
        self.inner.delete(key).await
    }

    async fn query(
        &self,
        prefix: &str,
    ) -> Result<mpsc::Receiver<(String, Vec<u8>)>, DatastoreError> {
        let mut fast = self.inner.query(prefix).await?;
        let delay = self.scan_delay;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(pair) = fast.recv().await {
                sleep(delay).await;
                if tx.send(pair).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

async fn stored_block(store: &MemoryBlockStore, data: &[u8]) -> Cid {
    let block = Block::new(data.to_vec()).unwrap();
    let cid = block.cid;
    store.put(block).await.unwrap();
    cid
}

async fn wait_for_calls(router: &RecordingRouter, count: usize) {
    for _ in 0..500 {
        if router.calls().len() >= count {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} routing calls, saw {:?}", count, router.calls());
}

#[tokio::test]
async fn test_trigger_reannounces_tracked_set() {
    init_tracing();

    let block_store = Arc::new(MemoryBlockStore::new());
    let router = RecordingRouter::new();
    let a = stored_block(&block_store, b"tracked a").await;
    let b = stored_block(&block_store, b"tracked b").await;

    let node = Node::new(
        Arc::new(MemoryDatastore::new()) as Arc<dyn Datastore>,
        block_store as Arc<dyn BlockStore>,
        router.clone() as Arc<dyn ContentRouting>,
        root_strategy(),
        Duration::ZERO,
    )
    .await
    .unwrap();
    node.tracker().track(a).await.unwrap();
    node.tracker().track(b).await.unwrap();
    node.start().await;

    node.trigger().await.unwrap();
    wait_for_calls(&router, 2).await;

    let calls = router.calls();
    assert!(calls.contains(&a));
    assert!(calls.contains(&b));

    // The cycle refreshes tracking rather than clearing it.
    assert!(node.tracker().is_tracking(&a).await.unwrap());
    assert!(node.tracker().is_tracking(&b).await.unwrap());

    timeout(Duration::from_secs(20), node.stop())
        .await
        .expect("shutdown did not finish");
}

#[tokio::test]
async fn test_repeated_cycles_keep_announcing() {
    init_tracing();

    let block_store = Arc::new(MemoryBlockStore::new());
    let router = RecordingRouter::new();
    let a = stored_block(&block_store, b"refresh me").await;

    let node = Node::new(
        Arc::new(MemoryDatastore::new()) as Arc<dyn Datastore>,
        block_store as Arc<dyn BlockStore>,
        router.clone() as Arc<dyn ContentRouting>,
        root_strategy(),
        Duration::ZERO,
    )
    .await
    .unwrap();
    node.tracker().track(a).await.unwrap();
    node.start().await;

    node.trigger().await.unwrap();
    wait_for_calls(&router, 1).await;

    node.trigger().await.unwrap();
    wait_for_calls(&router, 2).await;

    assert_eq!(router.calls(), vec![a, a]);

    timeout(Duration::from_secs(20), node.stop())
        .await
        .expect("shutdown did not finish");
}

#[tokio::test]
async fn test_concurrent_trigger_is_rejected() {
    init_tracing();

    let block_store = Arc::new(MemoryBlockStore::new());
    let router = RecordingRouter::new();

    // ~40 tracked CIDs at 25ms per scanned key keeps the reprovide
    // window open for about a second.
    let store = Arc::new(SlowScanStore {
        inner: MemoryDatastore::new(),
        scan_delay: Duration::from_millis(25),
    });

    let node = Arc::new(
        Node::new(
            store as Arc<dyn Datastore>,
            block_store.clone() as Arc<dyn BlockStore>,
            router.clone() as Arc<dyn ContentRouting>,
            root_strategy(),
            Duration::ZERO,
        )
        .await
        .unwrap(),
    );

    for i in 0..40u8 {
        let cid = stored_block(&block_store, &[b'r', i]).await;
        node.tracker().track(cid).await.unwrap();
    }

    node.start().await;

    let first = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.trigger().await })
    };

    // Let the first reprovision get under way, then race a second one.
    sleep(Duration::from_millis(300)).await;
    let second = node.trigger().await;

    match second {
        Err(ReproviderError::AlreadyRunning) => {}
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(
        ReproviderError::AlreadyRunning.to_string(),
        "reprovider is already running"
    );

    // The first trigger completes normally.
    timeout(Duration::from_secs(30), first)
        .await
        .expect("first trigger did not finish")
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(20), node.stop())
        .await
        .expect("shutdown did not finish");
}
