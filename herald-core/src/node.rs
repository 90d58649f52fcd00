//! Node composition and lifecycle
//!
//! The composition root owns the datastore, both queues, the tracker,
//! the provider and the reprovider; the components themselves hold
//! non-owning references. Shutdown cancels one root token and joins
//! every task the components spawned, bounded by at most one in-flight
//! announce timeout.

use cid::Cid;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::block_store::{BlockStore, DatastoreBlockStore};
use crate::config::Config;
use crate::datastore::{Datastore, DatastoreError};
use crate::provider::{Provider, ProviderError};
use crate::queue::{Queue, QueueError};
use crate::redb_store::RedbDatastore;
use crate::reprovider::{Reprovider, ReproviderError};
use crate::routing::{ContentRouting, LogRouter};
use crate::strategy::{root_strategy, Strategy};
use crate::tracker::Tracker;

/// Queue and tracker namespace for the provide path
const PROVIDER_NAMESPACE: &str = "provider";

/// Queue namespace for the reprovide path
const REPROVIDER_NAMESPACE: &str = "reprovider";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Announcement engine wired together over shared storage and routing.
pub struct Node {
    cancel: CancellationToken,
    provider: Provider,
    reprovider: Reprovider,
    provide_queue: Arc<Queue>,
    reprovide_queue: Arc<Queue>,
    tracker: Arc<Tracker>,
}

impl Node {
    /// Build the engine. `reprovide_interval` of zero disables periodic
    /// reprovision; announcements then refresh only on `trigger`.
    pub async fn new(
        store: Arc<dyn Datastore>,
        block_store: Arc<dyn BlockStore>,
        routing: Arc<dyn ContentRouting>,
        strategy: Strategy,
        reprovide_interval: Duration,
    ) -> Result<Self, NodeError> {
        let cancel = CancellationToken::new();

        let provide_queue = Arc::new(
            Queue::new(PROVIDER_NAMESPACE, Arc::clone(&store), cancel.child_token()).await?,
        );
        let reprovide_queue = Arc::new(
            Queue::new(
                REPROVIDER_NAMESPACE,
                Arc::clone(&store),
                cancel.child_token(),
            )
            .await?,
        );
        let tracker = Arc::new(Tracker::new(PROVIDER_NAMESPACE, store));

        let provider = Provider::new(
            cancel.child_token(),
            strategy,
            Arc::clone(&tracker),
            Arc::clone(&provide_queue),
            Arc::clone(&block_store),
            Arc::clone(&routing),
        );
        let reprovider = Reprovider::new(
            cancel.child_token(),
            Arc::clone(&reprovide_queue),
            Arc::clone(&tracker),
            reprovide_interval,
            block_store,
            routing,
        );

        Ok(Self {
            cancel,
            provider,
            reprovider,
            provide_queue,
            reprovide_queue,
            tracker,
        })
    }

    /// Start both announce pools and the reprovide trigger loop.
    pub async fn start(&self) {
        self.provider.run().await;
        self.reprovider.run().await;
        info!("announcement engine started");
    }

    /// Advertise `root` (expanded through the configured strategy).
    pub async fn provide(&self, root: Cid) -> Result<(), ProviderError> {
        self.provider.provide(root).await
    }

    /// Stop advertising `cid`.
    pub async fn unprovide(&self, cid: Cid) -> Result<(), ProviderError> {
        self.provider.unprovide(cid).await
    }

    /// Enqueue every tracked CID for re-announcement without waiting.
    pub async fn reprovide(&self) -> Result<(), ReproviderError> {
        self.reprovider.reprovide().await
    }

    /// Run a full reprovision and wait for it to finish.
    pub async fn trigger(&self) -> Result<(), ReproviderError> {
        self.reprovider.trigger().await
    }

    /// The durable set of announced CIDs.
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Cancel every owned task and wait for all of them to exit.
    pub async fn stop(&self) {
        info!("stopping announcement engine");
        self.cancel.cancel();
        self.provider.shutdown().await;
        self.reprovider.shutdown().await;
        self.provide_queue.shutdown().await;
        self.reprovide_queue.shutdown().await;
        info!("announcement engine stopped");
    }
}

/// Run a standalone announcement node until ctrl-c.
///
/// Opens the persistent datastore under the configured data directory
/// and serves blocks out of it. Announcements go to the log-only routing
/// backend.
// TODO: wire a DHT client in place of LogRouter once the discovery
// layer lands.
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store: Arc<dyn Datastore> =
        Arc::new(RedbDatastore::open(config.data_dir.join("herald.redb"))?);
    let block_store: Arc<dyn BlockStore> =
        Arc::new(DatastoreBlockStore::new(Arc::clone(&store)));
    let routing: Arc<dyn ContentRouting> = Arc::new(LogRouter);

    let node = Node::new(
        store,
        block_store,
        routing,
        root_strategy(),
        Duration::from_secs(config.reprovide_interval_secs),
    )
    .await?;

    node.start().await;
    info!(data_dir = %config.data_dir.display(), "node running, press ctrl-c to stop");

    signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");

    node.stop().await;
    Ok(())
}
