//! Herald Core
//!
//! Content-announcement engine for a content-addressed storage node:
//! a durable queue of CIDs, a tracker of what has been announced, and
//! the provide/reprovide worker pools that keep the routing layer fresh.

pub mod block_store;
pub mod config;
pub mod content_id;
pub mod datastore;
pub mod node;
pub mod provider;
pub mod queue;
pub mod redb_store;
pub mod reprovider;
pub mod routing;
pub mod strategy;
pub mod tracker;

pub use block_store::{Block, BlockStore, DatastoreBlockStore, MemoryBlockStore};
pub use config::Config;
pub use datastore::{Datastore, DatastoreError, MemoryDatastore};
pub use node::{run_node, Node, NodeError};
pub use provider::{Provider, ProviderError};
pub use queue::{Entry, Queue, QueueError};
pub use redb_store::RedbDatastore;
pub use reprovider::{Reprovider, ReproviderError};
pub use routing::{ContentRouting, LogRouter, RoutingError};
pub use strategy::{fixed_strategy, root_strategy, Strategy};
pub use tracker::{Tracker, TrackerError};
