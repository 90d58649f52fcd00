//! Block storage
//!
//! The announcement engine only asks one question of the block store --
//! "do we still hold this CID?" -- so the seam is a small trait. Two
//! implementations ship with it: a CID-verified in-memory store and a
//! persistent store layered over the datastore.

use async_trait::async_trait;
use cid::Cid;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::content_id::{block_cid, verify_block, ContentIdError};
use crate::datastore::{Datastore, DatastoreError};

/// Key prefix for blocks persisted in the datastore
const BLOCK_PREFIX: &str = "/blocks/";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] ContentIdError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a new block from data, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, ContentIdError> {
        let cid = block_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, ContentIdError> {
        verify_block(&data, &cid)?;
        Ok(Self { cid, data })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Source of truth for "do we hold this CID?".
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError>;
}

/// In-memory block store with CID verification on insert.
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Cid, Block>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a block, verifying its CID. Re-inserting an existing block
    /// is a no-op.
    pub async fn put(&self, block: Block) -> Result<(), StorageError> {
        {
            let blocks = self.blocks.read().await;
            if blocks.contains_key(&block.cid) {
                debug!(cid = %block.cid, "block already stored");
                return Ok(());
            }
        }

        verify_block(&block.data, &block.cid)?;

        let mut blocks = self.blocks.write().await;
        blocks.insert(block.cid, block);
        Ok(())
    }

    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let blocks = self.blocks.read().await;
        blocks
            .get(cid)
            .cloned()
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))
    }

    pub async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write().await;
        blocks
            .remove(cid)
            .map(|_| ())
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))
    }

    /// All CIDs currently held
    pub async fn list_cids(&self) -> Vec<Cid> {
        self.blocks.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        Ok(self.blocks.read().await.contains_key(cid))
    }
}

/// Persistent block store layered over a datastore under `/blocks/`.
pub struct DatastoreBlockStore {
    store: Arc<dyn Datastore>,
}

impl DatastoreBlockStore {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    fn block_key(cid: &Cid) -> String {
        format!("{}{}", BLOCK_PREFIX, cid)
    }

    pub async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_block(&block.data, &block.cid)?;
        self.store
            .put(&Self::block_key(&block.cid), block.data)
            .await?;
        Ok(())
    }

    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        match self.store.get(&Self::block_key(cid)).await {
            Ok(data) => Ok(Block::from_cid_and_data(*cid, data)?),
            Err(DatastoreError::NotFound(_)) => {
                Err(StorageError::BlockNotFound(cid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        self.store.delete(&Self::block_key(cid)).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for DatastoreBlockStore {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        match self.store.get(&Self::block_key(cid)).await {
            Ok(_) => Ok(true),
            Err(DatastoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
