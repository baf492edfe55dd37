//! Durable header index rows.
//!
//! The in-memory chain index is rebuilt from this tree at startup; rows are
//! append-only within a run. `seq` records insertion order for first-seen
//! tie-breaking between equal-work tips.

use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

/// A chained header as persisted: header plus chain position and work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub header: BlockHeader,
    pub height: u32,
    /// Cumulative work from genesis, big-endian 256-bit.
    pub total_work: [u8; 32],
    /// Insertion sequence, for first-seen ordering.
    pub seq: u64,
}

pub struct HeaderStore {
    tree: sled::Tree,
}

impl HeaderStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn get(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StorageError> {
        match self.tree.get(hash.to_byte_array())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.tree.contains_key(hash.to_byte_array())?)
    }

    pub fn insert(&self, hash: &BlockHash, stored: &StoredHeader) -> Result<(), StorageError> {
        self.tree
            .insert(hash.to_byte_array(), bincode::serialize(stored)?)?;
        self.tree.flush()?;
        debug!(%hash, height = stored.height, "persisted header");
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<(BlockHash, StoredHeader)>, StorageError> {
        let mut headers = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let arr: [u8; 32] = key.as_ref().try_into().map_err(|_| {
                StorageError::Corrupt(format!("header key of length {}", key.len()))
            })?;
            headers.push((BlockHash::from_byte_array(arr), bincode::deserialize(&value)?));
        }
        Ok(headers)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
