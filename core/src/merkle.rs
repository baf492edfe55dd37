//! Merkle root computation over transaction ids.
//!
//! The builder is fed leaf-by-leaf by the validator's first stage. It also
//! owns the duplicate-hash defence: a transaction id seen twice sets the
//! `repeated` flag and the stream is truncated at that point, which
//! guarantees the finalized root can never satisfy the header commitment
//! (CVE-2012-2459: the failure must surface as a merkle mismatch, not as a
//! double spend).

use std::collections::HashSet;

use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{TxMerkleNode, Txid};

fn pair(left: &sha256d::Hash, right: &sha256d::Hash) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(left.as_byte_array());
    engine.input(right.as_byte_array());
    sha256d::Hash::from_engine(engine)
}

/// Root over a txid list, duplicating the last node of odd levels.
pub fn merkle_root(txids: &[Txid]) -> TxMerkleNode {
    if txids.is_empty() {
        return TxMerkleNode::from_byte_array([0u8; 32]);
    }
    let mut level: Vec<sha256d::Hash> = txids.iter().map(|txid| txid.to_raw_hash()).collect();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            level.push(*level.last().expect("level is non-empty"));
        }
        level = level
            .chunks(2)
            .map(|chunk| pair(&chunk[0], &chunk[1]))
            .collect();
    }
    TxMerkleNode::from_raw_hash(level[0])
}

/// Streaming-fed merkle builder with duplicate detection.
pub struct MerkleBuilder {
    leaves: Vec<Txid>,
    seen: HashSet<Txid>,
    repeated: bool,
}

impl MerkleBuilder {
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            seen: HashSet::new(),
            repeated: false,
        }
    }

    /// Add a leaf. Returns false, recording the repetition, when the
    /// txid was already pushed; the caller must stop feeding.
    pub fn push(&mut self, txid: Txid) -> bool {
        if !self.seen.insert(txid) {
            self.repeated = true;
            return false;
        }
        self.leaves.push(txid);
        true
    }

    pub fn repeated(&self) -> bool {
        self.repeated
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn finalize(&self) -> TxMerkleNode {
        merkle_root(&self.leaves)
    }
}

impl Default for MerkleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
