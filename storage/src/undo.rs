//! Per-block undo records.
//!
//! Enough information to reverse a block's effect on the UTXO set: every
//! output the block spent (with the payload and the creating transaction's
//! coordinates, so a pruned row can be rebuilt exactly) and every transaction
//! the block created.

use bitcoin::{BlockHash, OutPoint, TxOut, Txid};
use serde::{Deserialize, Serialize};

/// One output consumed by the block, with what it takes to restore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentOutputUndo {
    pub outpoint: OutPoint,
    pub output: TxOut,
    /// Height of the block that created the output.
    pub block_height: u32,
    /// Index of the creating transaction within that block.
    pub tx_index: u32,
    /// Output count of the creating transaction.
    pub output_count: u32,
}

/// Undo data for one applied block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndoData {
    pub block_hash: BlockHash,
    pub height: u32,
    /// Outputs spent by the block, in block spend order.
    pub spent: Vec<SpentOutputUndo>,
    /// Transactions created by the block, in block order, with output counts.
    pub created: Vec<(Txid, u32)>,
}

impl BlockUndoData {
    pub fn new(block_hash: BlockHash, height: u32) -> Self {
        Self {
            block_hash,
            height,
            spent: Vec::new(),
            created: Vec::new(),
        }
    }
}
