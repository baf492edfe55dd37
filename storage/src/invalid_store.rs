//! Durable set of blocks that failed validation.

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use tracing::debug;

use crate::error::StorageError;

pub struct InvalidBlockStore {
    tree: sled::Tree,
}

impl InvalidBlockStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Record a block as invalid. Returns false if it was already recorded
    /// (the original reason is kept).
    pub fn add(&self, hash: &BlockHash, reason: &str) -> Result<bool, StorageError> {
        let key = hash.to_byte_array();
        if self.tree.contains_key(key)? {
            return Ok(false);
        }
        self.tree.insert(key, reason.as_bytes())?;
        self.tree.flush()?;
        debug!(%hash, reason, "persisted invalid block");
        Ok(true)
    }

    pub fn contains(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.tree.contains_key(hash.to_byte_array())?)
    }

    pub fn reason(&self, hash: &BlockHash) -> Result<Option<String>, StorageError> {
        Ok(self
            .tree
            .get(hash.to_byte_array())?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn load_all(&self) -> Result<Vec<BlockHash>, StorageError> {
        let mut hashes = Vec::new();
        for item in self.tree.iter() {
            let (key, _) = item?;
            let arr: [u8; 32] = key.as_ref().try_into().map_err(|_| {
                StorageError::Corrupt(format!("invalid-block key of length {}", key.len()))
            })?;
            hashes.push(BlockHash::from_byte_array(arr));
        }
        Ok(hashes)
    }
}
