use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::chain_state::ChainStateStore;
use crate::error::StorageError;
use crate::header_store::HeaderStore;
use crate::invalid_store::InvalidBlockStore;
use crate::mempool_store::MempoolStore;

/// Tree names (sled's equivalent of column families)
const TREE_CHAIN_STATE: &str = "chain_state";
const TREE_HEADERS: &str = "headers";
const TREE_INVALID_BLOCKS: &str = "invalid_blocks";
const TREE_MEMPOOL: &str = "mempool";

/// Main database wrapper using sled.
///
/// One `Database` hands out the individual stores; each store owns its tree.
/// The chain-state store keeps every chain-state record (UTXO rows, undo data,
/// chain tip) in a single tree so per-block commits apply as one atomic batch.
pub struct Database {
    db: sled::Db,
}

impl Database {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        info!("opening database at {}", path.as_ref().display());
        let db = sled::Config::default().path(path).open()?;
        Ok(Self { db })
    }

    /// Open a throwaway database backed by a temp directory.
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Open the chain-state (UTXO set + undo + tip) store.
    pub fn open_chain_state(&self) -> Result<Arc<ChainStateStore>, StorageError> {
        let tree = self.db.open_tree(TREE_CHAIN_STATE)?;
        Ok(Arc::new(ChainStateStore::new(tree)))
    }

    /// Open the header index store.
    pub fn open_header_store(&self) -> Result<Arc<HeaderStore>, StorageError> {
        let tree = self.db.open_tree(TREE_HEADERS)?;
        Ok(Arc::new(HeaderStore::new(tree)))
    }

    /// Open the durable invalid-block set.
    pub fn open_invalid_block_store(&self) -> Result<Arc<InvalidBlockStore>, StorageError> {
        let tree = self.db.open_tree(TREE_INVALID_BLOCKS)?;
        Ok(Arc::new(InvalidBlockStore::new(tree)))
    }

    /// Open the mempool store.
    pub fn open_mempool_store(&self) -> Result<Arc<MempoolStore>, StorageError> {
        let tree = self.db.open_tree(TREE_MEMPOOL)?;
        Ok(Arc::new(MempoolStore::new(tree)))
    }

    /// sled readers never block behind the single chain-state writer.
    pub fn supports_concurrent_readers(&self) -> bool {
        true
    }

    /// Whether mempool admission may run under a shared (reader) update lock.
    pub fn supports_concurrent_writers(&self) -> bool {
        true
    }

    /// Flush all trees to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
