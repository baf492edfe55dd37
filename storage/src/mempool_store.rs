//! Mempool persistence.
//!
//! One tree, prefixed keys:
//!
//! - `t` ++ txid                      → serialized unconfirmed tx (opaque bytes;
//!   the mempool crate owns the record format)
//! - `s` ++ outpoint ++ txid          → (), which mempool txes spend which output
//! - `m/tip`                          → the mempool's view of the chain tip
//!
//! The mempool writes a block's worth of confirmations/evictions plus the tip
//! bump through one [`MempoolCursor`], so its durable state moves tip-to-tip
//! the same way the chain state does.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::error::StorageError;

const PREFIX_TX: u8 = b't';
const PREFIX_SPEND: u8 = b's';
const META_TIP: &[u8] = b"m/tip";

fn tx_key(txid: &Txid) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(PREFIX_TX);
    key.extend_from_slice(&txid.to_byte_array());
    key
}

fn spend_key(outpoint: &OutPoint, txid: &Txid) -> Vec<u8> {
    let mut key = Vec::with_capacity(69);
    key.push(PREFIX_SPEND);
    key.extend_from_slice(&outpoint.txid.to_byte_array());
    key.extend_from_slice(&outpoint.vout.to_le_bytes());
    key.extend_from_slice(&txid.to_byte_array());
    key
}

fn spend_prefix(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(PREFIX_SPEND);
    key.extend_from_slice(&outpoint.txid.to_byte_array());
    key.extend_from_slice(&outpoint.vout.to_le_bytes());
    key
}

pub struct MempoolStore {
    tree: sled::Tree,
    writer: Mutex<()>,
}

impl MempoolStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self {
            tree,
            writer: Mutex::new(()),
        }
    }

    pub fn begin(&self, read_only: bool) -> MempoolCursor<'_> {
        let writer = if read_only {
            None
        } else {
            Some(self.writer.lock())
        };
        MempoolCursor {
            store: self,
            _writer: writer,
            staged: BTreeMap::new(),
            read_only,
            committed: false,
        }
    }

    /// Committed chain tip as the mempool last saw it.
    pub fn chain_tip(&self) -> Result<Option<BlockHash>, StorageError> {
        match self.tree.get(META_TIP)? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes.as_ref().try_into().map_err(|_| {
                    StorageError::Corrupt(format!("mempool tip of length {}", bytes.len()))
                })?;
                Ok(Some(BlockHash::from_byte_array(arr)))
            }
            None => Ok(None),
        }
    }

    /// All persisted unconfirmed transactions (startup recovery).
    pub fn load_all(&self) -> Result<Vec<(Txid, Vec<u8>)>, StorageError> {
        let mut rows = Vec::new();
        for item in self.tree.scan_prefix([PREFIX_TX]) {
            let (key, value) = item?;
            let arr: [u8; 32] = key
                .get(1..33)
                .and_then(|slice| slice.try_into().ok())
                .ok_or_else(|| {
                    StorageError::Corrupt(format!("mempool tx key of length {}", key.len()))
                })?;
            rows.push((Txid::from_byte_array(arr), value.to_vec()));
        }
        Ok(rows)
    }
}

/// Transactional scope over the mempool store; same staging/commit discipline
/// as the chain-state cursor.
pub struct MempoolCursor<'a> {
    store: &'a MempoolStore,
    _writer: Option<MutexGuard<'a, ()>>,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    read_only: bool,
    committed: bool,
}

impl<'a> MempoolCursor<'a> {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnlyCursor);
        }
        self.staged.insert(key, Some(value));
        Ok(())
    }

    fn delete(&mut self, key: Vec<u8>) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnlyCursor);
        }
        self.staged.insert(key, None);
        Ok(())
    }

    pub fn put_tx(&mut self, txid: &Txid, record: Vec<u8>) -> Result<(), StorageError> {
        self.put(tx_key(txid), record)
    }

    pub fn delete_tx(&mut self, txid: &Txid) -> Result<(), StorageError> {
        self.delete(tx_key(txid))
    }

    pub fn add_spend(&mut self, outpoint: &OutPoint, txid: &Txid) -> Result<(), StorageError> {
        self.put(spend_key(outpoint, txid), Vec::new())
    }

    pub fn delete_spend(&mut self, outpoint: &OutPoint, txid: &Txid) -> Result<(), StorageError> {
        self.delete(spend_key(outpoint, txid))
    }

    /// Committed spenders of an output (the in-memory index is authoritative
    /// while the pool is live; this serves recovery and tests).
    pub fn spenders(&self, outpoint: &OutPoint) -> Result<Vec<Txid>, StorageError> {
        let mut txids = Vec::new();
        for item in self.store.tree.scan_prefix(spend_prefix(outpoint)) {
            let (key, _) = item?;
            let arr: [u8; 32] = key
                .get(37..69)
                .and_then(|slice| slice.try_into().ok())
                .ok_or_else(|| {
                    StorageError::Corrupt(format!("mempool spend key of length {}", key.len()))
                })?;
            txids.push(Txid::from_byte_array(arr));
        }
        Ok(txids)
    }

    pub fn set_chain_tip(&mut self, hash: &BlockHash) -> Result<(), StorageError> {
        self.put(META_TIP.to_vec(), hash.to_byte_array().to_vec())
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnlyCursor);
        }
        let mut batch = sled::Batch::default();
        for (key, staged) in std::mem::take(&mut self.staged) {
            match staged {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        self.store.tree.apply_batch(batch)?;
        self.store.tree.flush()?;
        self.committed = true;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.staged.clear();
        self.committed = true;
    }
}

impl Drop for MempoolCursor<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            trace!(
                staged = self.staged.len(),
                "mempool cursor dropped without commit; rolling back"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (sled::Db, MempoolStore) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("mempool").unwrap();
        (db, MempoolStore::new(tree))
    }

    #[test]
    fn tx_and_spend_round_trip() {
        let (_db, store) = test_store();
        let txid = Txid::from_byte_array([7u8; 32]);
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([1u8; 32]),
            vout: 2,
        };

        let mut cursor = store.begin(false);
        cursor.put_tx(&txid, vec![1, 2, 3]).unwrap();
        cursor.add_spend(&outpoint, &txid).unwrap();
        cursor.commit().unwrap();

        let cursor = store.begin(true);
        assert_eq!(cursor.spenders(&outpoint).unwrap(), vec![txid]);
        drop(cursor);
        assert_eq!(store.load_all().unwrap(), vec![(txid, vec![1, 2, 3])]);

        let mut cursor = store.begin(false);
        cursor.delete_tx(&txid).unwrap();
        cursor.delete_spend(&outpoint, &txid).unwrap();
        cursor.commit().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn tip_survives_reopen_of_cursor() {
        let (_db, store) = test_store();
        let tip = BlockHash::from_byte_array([3u8; 32]);
        let mut cursor = store.begin(false);
        cursor.set_chain_tip(&tip).unwrap();
        cursor.commit().unwrap();
        assert_eq!(store.chain_tip().unwrap(), Some(tip));
    }
}
