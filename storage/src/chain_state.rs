//! Chain-state (UTXO set) store.
//!
//! One sled tree holds every chain-state record, distinguished by a key
//! prefix:
//!
//! - `t` ++ txid            → [`UnspentTx`] (height, index in block, per-output states)
//! - `o` ++ txid ++ vout    → the output itself ([`bitcoin::TxOut`])
//! - `u` ++ block hash      → [`crate::BlockUndoData`]
//! - `m/tip`, `m/count`     → chain tip, unspent-tx count
//!
//! Keeping the records in one tree means a block's mutations (output
//! creation, spends, undo data, the tip bump) land in a single
//! [`sled::Batch`], which sled applies atomically. A crash between blocks can
//! therefore never expose a tip that disagrees with the UTXO rows.
//!
//! All mutation goes through [`ChainStateCursor`]. A write cursor holds the
//! store's writer token for its whole scope (one writer at a time); readers go
//! straight to the committed tree and never block.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, TxOut, Txid};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::StorageError;
use crate::undo::BlockUndoData;

const PREFIX_UNSPENT_TX: u8 = b't';
const PREFIX_OUTPUT: u8 = b'o';
const PREFIX_UNDO: u8 = b'u';
const META_TIP: &[u8] = b"m/tip";
const META_COUNT: &[u8] = b"m/count";

/// Spend state of a single transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputState {
    Unspent,
    Spent,
}

/// Per-output spend states of one transaction, as a bitmap (set bit = spent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStates {
    len: u32,
    bits: Vec<u8>,
}

impl OutputStates {
    /// All outputs unspent.
    pub fn all_unspent(len: u32) -> Self {
        Self {
            len,
            bits: vec![0u8; len.div_ceil(8) as usize],
        }
    }

    /// All outputs spent (used when restoring a pruned row during unwind).
    pub fn all_spent(len: u32) -> Self {
        let mut states = Self::all_unspent(len);
        for index in 0..len {
            states.set(index, OutputState::Spent);
        }
        states
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self, index: u32) -> OutputState {
        debug_assert!(index < self.len);
        if self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0 {
            OutputState::Spent
        } else {
            OutputState::Unspent
        }
    }

    pub fn set(&mut self, index: u32, state: OutputState) {
        debug_assert!(index < self.len);
        let byte = &mut self.bits[(index / 8) as usize];
        match state {
            OutputState::Spent => *byte |= 1 << (index % 8),
            OutputState::Unspent => *byte &= !(1 << (index % 8)),
        }
    }

    pub fn spent_count(&self) -> u32 {
        (0..self.len)
            .filter(|&i| self.state(i) == OutputState::Spent)
            .count() as u32
    }

    pub fn is_fully_spent(&self) -> bool {
        self.spent_count() == self.len
    }
}

/// A transaction with at least one unspent output, as stored in the UTXO set.
///
/// The output payloads live in the side rows so flipping a spend bit does not
/// rewrite script bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTx {
    pub block_height: u32,
    pub tx_index: u32,
    pub output_states: OutputStates,
}

impl UnspentTx {
    pub fn new(block_height: u32, tx_index: u32, output_count: u32) -> Self {
        Self {
            block_height,
            tx_index,
            output_states: OutputStates::all_unspent(output_count),
        }
    }

    /// The coinbase always occupies slot zero of its block.
    pub fn is_coinbase(&self) -> bool {
        self.tx_index == 0
    }

    pub fn output_count(&self) -> u32 {
        self.output_states.len()
    }
}

/// Chain-state store statistics.
#[derive(Debug, Default, Clone)]
pub struct ChainStateStats {
    pub unspent_txs: u64,
    pub unspent_outputs: u64,
}

/// The persistent UTXO set, chain tip, and undo data.
pub struct ChainStateStore {
    tree: sled::Tree,
    writer: Mutex<()>,
}

fn tx_key(txid: &Txid) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(PREFIX_UNSPENT_TX);
    key.extend_from_slice(&txid.to_byte_array());
    key
}

fn output_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(PREFIX_OUTPUT);
    key.extend_from_slice(&outpoint.txid.to_byte_array());
    key.extend_from_slice(&outpoint.vout.to_le_bytes());
    key
}

fn undo_key(hash: &BlockHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(PREFIX_UNDO);
    key.extend_from_slice(&hash.to_byte_array());
    key
}

fn decode_txid(key: &[u8]) -> Result<Txid, StorageError> {
    let bytes: [u8; 32] = key
        .get(1..33)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| StorageError::Corrupt(format!("unspent-tx key of length {}", key.len())))?;
    Ok(Txid::from_byte_array(bytes))
}

impl ChainStateStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self {
            tree,
            writer: Mutex::new(()),
        }
    }

    /// sled gives readers lock-free snapshots of committed state, so they
    /// never queue behind the single writer.
    pub fn supports_concurrent_readers(&self) -> bool {
        true
    }

    /// Open a cursor. A write cursor takes the store's writer token and holds
    /// it until the cursor goes out of scope; read cursors see the last
    /// committed state and never block.
    pub fn begin(&self, read_only: bool) -> ChainStateCursor<'_> {
        let writer = if read_only {
            None
        } else {
            Some(self.writer.lock())
        };
        ChainStateCursor {
            store: self,
            _writer: writer,
            staged: BTreeMap::new(),
            read_only,
            committed: false,
        }
    }

    /// Committed chain tip, bypassing any open cursor.
    pub fn chain_tip(&self) -> Result<Option<BlockHash>, StorageError> {
        match self.tree.get(META_TIP)? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes.as_ref().try_into().map_err(|_| {
                    StorageError::Corrupt(format!("chain tip of length {}", bytes.len()))
                })?;
                Ok(Some(BlockHash::from_byte_array(arr)))
            }
            None => Ok(None),
        }
    }

    /// Committed unspent-transaction count.
    pub fn unspent_tx_count(&self) -> Result<u64, StorageError> {
        match self.tree.get(META_COUNT)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    StorageError::Corrupt(format!("unspent count of length {}", bytes.len()))
                })?;
                Ok(u64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Committed undo data for a block.
    pub fn block_undo(&self, hash: &BlockHash) -> Result<Option<BlockUndoData>, StorageError> {
        match self.tree.get(undo_key(hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop undo records for blocks below `height`. Maintenance only; takes
    /// the writer token for its duration.
    pub fn prune_undo_below(&self, height: u32) -> Result<usize, StorageError> {
        let _writer = self.writer.lock();
        let mut batch = sled::Batch::default();
        let mut pruned = 0usize;
        for item in self.tree.scan_prefix([PREFIX_UNDO]) {
            let (key, value) = item?;
            let undo: BlockUndoData = bincode::deserialize(&value)?;
            if undo.height < height {
                batch.remove(key.as_ref());
                pruned += 1;
            }
        }
        self.tree.apply_batch(batch)?;
        Ok(pruned)
    }

    /// Walk the committed UTXO rows (expensive; tests and diagnostics).
    pub fn stats(&self) -> Result<ChainStateStats, StorageError> {
        let mut stats = ChainStateStats::default();
        for item in self.tree.scan_prefix([PREFIX_UNSPENT_TX]) {
            let _ = item?;
            stats.unspent_txs += 1;
        }
        for item in self.tree.scan_prefix([PREFIX_OUTPUT]) {
            let _ = item?;
            stats.unspent_outputs += 1;
        }
        Ok(stats)
    }
}

/// Transactional scope over the chain state.
///
/// Writes stage in memory; `commit` applies them as one atomic batch and
/// flushes. Dropping the cursor without committing discards the staged
/// changes, which is the auto-rollback half of the contract.
pub struct ChainStateCursor<'a> {
    store: &'a ChainStateStore,
    _writer: Option<MutexGuard<'a, ()>>,
    /// key → Some(value) for puts, None for deletes
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    read_only: bool,
    committed: bool,
}

impl<'a> ChainStateCursor<'a> {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.store.tree.get(key)?.map(|ivec| ivec.to_vec()))
    }

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

    pub fn chain_tip(&self) -> Result<Option<BlockHash>, StorageError> {
        match self.read(META_TIP)? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Corrupt(format!("chain tip of length {}", bytes.len()))
                })?;
                Ok(Some(BlockHash::from_byte_array(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn set_chain_tip(&mut self, hash: &BlockHash) -> Result<(), StorageError> {
        self.put(META_TIP.to_vec(), hash.to_byte_array().to_vec())
    }

    pub fn unspent_tx_count(&self) -> Result<u64, StorageError> {
        match self.read(META_COUNT)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Corrupt(format!("unspent count of length {}", bytes.len()))
                })?;
                Ok(u64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    pub fn set_unspent_tx_count(&mut self, count: u64) -> Result<(), StorageError> {
        self.put(META_COUNT.to_vec(), count.to_le_bytes().to_vec())
    }

    pub fn try_get_unspent_tx(&self, txid: &Txid) -> Result<Option<UnspentTx>, StorageError> {
        match self.read(&tx_key(txid))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn try_get_unspent_output(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<TxOut>, StorageError> {
        match self.read(&output_key(outpoint))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Add a freshly confirmed transaction with all outputs unspent.
    /// Returns false (and stages nothing) if the txid is already present.
    pub fn try_add_unspent_tx(
        &mut self,
        txid: &Txid,
        block_height: u32,
        tx_index: u32,
        outputs: &[TxOut],
    ) -> Result<bool, StorageError> {
        if self.try_get_unspent_tx(txid)?.is_some() {
            return Ok(false);
        }
        let unspent = UnspentTx::new(block_height, tx_index, outputs.len() as u32);
        self.put(tx_key(txid), bincode::serialize(&unspent)?)?;
        for (vout, output) in outputs.iter().enumerate() {
            let outpoint = OutPoint {
                txid: *txid,
                vout: vout as u32,
            };
            self.put(output_key(&outpoint), bincode::serialize(output)?)?;
        }
        let count = self.unspent_tx_count()?;
        self.set_unspent_tx_count(count + 1)?;
        trace!(%txid, block_height, tx_index, "added unspent tx");
        Ok(true)
    }

    /// Flip one output to Spent, deleting its payload row; returns the prior
    /// state, or None when the output is unknown. Fully spent transactions
    /// are removed from the set.
    pub fn try_spend_output(
        &mut self,
        outpoint: &OutPoint,
    ) -> Result<Option<OutputState>, StorageError> {
        let Some(mut unspent) = self.try_get_unspent_tx(&outpoint.txid)? else {
            return Ok(None);
        };
        if outpoint.vout >= unspent.output_count() {
            return Ok(None);
        }
        let previous = unspent.output_states.state(outpoint.vout);
        if previous == OutputState::Spent {
            return Ok(Some(OutputState::Spent));
        }
        unspent.output_states.set(outpoint.vout, OutputState::Spent);
        self.delete(output_key(outpoint))?;
        if unspent.output_states.is_fully_spent() {
            self.delete(tx_key(&outpoint.txid))?;
            let count = self.unspent_tx_count()?;
            self.set_unspent_tx_count(count.saturating_sub(1))?;
        } else {
            self.put(tx_key(&outpoint.txid), bincode::serialize(&unspent)?)?;
        }
        trace!(outpoint = %outpoint, "spent output");
        Ok(Some(OutputState::Unspent))
    }

    /// Reverse of [`try_spend_output`](Self::try_spend_output), used on
    /// rewind: restore the payload row and flip the state back, re-creating
    /// the transaction row if the spend had pruned it.
    pub fn unspend_output(
        &mut self,
        outpoint: &OutPoint,
        output: &TxOut,
        block_height: u32,
        tx_index: u32,
        output_count: u32,
    ) -> Result<(), StorageError> {
        let mut unspent = match self.try_get_unspent_tx(&outpoint.txid)? {
            Some(unspent) => unspent,
            None => {
                let count = self.unspent_tx_count()?;
                self.set_unspent_tx_count(count + 1)?;
                UnspentTx {
                    block_height,
                    tx_index,
                    output_states: OutputStates::all_spent(output_count),
                }
            }
        };
        if outpoint.vout >= unspent.output_count() {
            return Err(StorageError::Corrupt(format!(
                "unspend of {outpoint} beyond output count {}",
                unspent.output_count()
            )));
        }
        if unspent.output_states.state(outpoint.vout) == OutputState::Unspent {
            return Err(StorageError::Corrupt(format!(
                "unspend of already-unspent output {outpoint}"
            )));
        }
        unspent
            .output_states
            .set(outpoint.vout, OutputState::Unspent);
        self.put(tx_key(&outpoint.txid), bincode::serialize(&unspent)?)?;
        self.put(output_key(outpoint), bincode::serialize(output)?)?;
        Ok(())
    }

    /// Remove a transaction and any remaining output rows (unwind of a
    /// block's created outputs). Returns the removed row.
    pub fn try_remove_unspent_tx(
        &mut self,
        txid: &Txid,
    ) -> Result<Option<UnspentTx>, StorageError> {
        let Some(unspent) = self.try_get_unspent_tx(txid)? else {
            return Ok(None);
        };
        self.delete(tx_key(txid))?;
        for vout in 0..unspent.output_count() {
            let outpoint = OutPoint { txid: *txid, vout };
            self.delete(output_key(&outpoint))?;
        }
        let count = self.unspent_tx_count()?;
        self.set_unspent_tx_count(count.saturating_sub(1))?;
        Ok(Some(unspent))
    }

    pub fn block_undo(&self, hash: &BlockHash) -> Result<Option<BlockUndoData>, StorageError> {
        match self.read(&undo_key(hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_block_undo(&mut self, undo: &BlockUndoData) -> Result<(), StorageError> {
        self.put(undo_key(&undo.block_hash), bincode::serialize(undo)?)
    }

    pub fn delete_block_undo(&mut self, hash: &BlockHash) -> Result<(), StorageError> {
        self.delete(undo_key(hash))
    }

    /// Snapshot of the unspent-transaction rows as seen by this cursor
    /// (committed state plus staged changes).
    pub fn unspent_txs(&self) -> Result<Vec<(Txid, UnspentTx)>, StorageError> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.store.tree.scan_prefix([PREFIX_UNSPENT_TX]) {
            let (key, value) = item?;
            rows.insert(key.to_vec(), value.to_vec());
        }
        for (key, staged) in &self.staged {
            if key.first() == Some(&PREFIX_UNSPENT_TX) {
                match staged {
                    Some(value) => {
                        rows.insert(key.clone(), value.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        rows.into_iter()
            .map(|(key, value)| Ok((decode_txid(&key)?, bincode::deserialize(&value)?)))
            .collect()
    }

    /// Apply all staged changes as one atomic batch and flush.
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

    /// Discard all staged changes.
    pub fn rollback(mut self) {
        self.staged.clear();
        self.committed = true;
    }
}

impl Drop for ChainStateCursor<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            trace!(
                staged = self.staged.len(),
                "chain-state cursor dropped without commit; rolling back"
            );
        }
    }
}
