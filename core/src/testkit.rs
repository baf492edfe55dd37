//! Deterministic regtest-style fixtures: block mining against the easy pow
//! limit, throwaway transactions, and stub collaborators. Used by this
//! crate's tests and by downstream integration suites.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header as BlockHeader, Version as BlockVersion};
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use parking_lot::RwLock;

use crate::chain::ChainedHeader;
use crate::error::CoreError;
use crate::merkle;
use crate::params::ChainParams;
use crate::providers::{BlockBodyProvider, ScriptFlags, ScriptVerifier};
use crate::subsidy;
use crate::validation::{BlockContext, PrevOutput, ValidatableTx};
use crate::work::ChainWork;

/// Regtest-style parameters with single-block coinbase maturity, so spends
/// of the previous block's coinbase are exercisable in short scenarios.
pub fn test_params() -> ChainParams {
    let mut params = ChainParams::regtest();
    params.coinbase_maturity = 1;
    params
}

pub fn genesis_header(params: &ChainParams) -> ChainedHeader {
    let header = params.genesis.header;
    ChainedHeader::new(header, 0, ChainWork::from_bits(header.bits))
}

/// An anyone-can-spend output script (OP_TRUE).
pub fn anyone_can_spend() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x51])
}

fn coinbase_tx(height: u32, value: u64, salt: u32) -> Transaction {
    // height commitment first (BIP34 shape), then a salt push so sibling
    // blocks at one height get distinct txids
    let mut script_sig = subsidy::height_commitment(height);
    script_sig.push(0x04);
    script_sig.extend_from_slice(&salt.to_le_bytes());
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: anyone_can_spend(),
        }],
    }
}

/// A transaction spending `prev_tx`'s output `vout` into one
/// anyone-can-spend output of `value` satoshis.
pub fn spend(prev_tx: &Transaction, vout: u32, value: u64) -> Transaction {
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: prev_tx.compute_txid(),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: anyone_can_spend(),
        }],
    }
}

fn solve(header: &mut BlockHeader) {
    while header.validate_pow(header.target()).is_err() {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// Mine a block with fully explicit header fields.
pub fn mine_block(
    prev_hash: BlockHash,
    height: u32,
    txs: Vec<Transaction>,
    reward: u64,
    time: u32,
    bits: bitcoin::CompactTarget,
    salt: u32,
) -> Block {
    let mut txdata = vec![coinbase_tx(height, reward, salt)];
    txdata.extend(txs);
    let txids: Vec<Txid> = txdata.iter().map(|tx| tx.compute_txid()).collect();
    let mut header = BlockHeader {
        version: BlockVersion::from_consensus(2),
        prev_blockhash: prev_hash,
        merkle_root: merkle::merkle_root(&txids),
        time,
        bits,
        nonce: 0,
    };
    solve(&mut header);
    Block { header, txdata }
}

fn assemble(
    params: &ChainParams,
    prev_hash: BlockHash,
    height: u32,
    txs: Vec<Transaction>,
    reward: u64,
    salt: u32,
) -> Block {
    mine_block(
        prev_hash,
        height,
        txs,
        reward,
        params.genesis.header.time + height.saturating_mul(600) + salt,
        params.genesis.header.bits,
        salt,
    )
}

/// Mine the next block on `parent` with the scheduled subsidy as reward.
pub fn mine_child(params: &ChainParams, parent: &ChainedHeader, txs: Vec<Transaction>) -> Block {
    mine_child_with_time(params, parent, txs, 0)
}

/// Like [`mine_child`] with a salt mixed into the timestamp and coinbase,
/// for building distinct siblings.
pub fn mine_child_with_time(
    params: &ChainParams,
    parent: &ChainedHeader,
    txs: Vec<Transaction>,
    salt: u32,
) -> Block {
    let height = parent.height + 1;
    assemble(
        params,
        parent.hash,
        height,
        txs,
        subsidy::block_subsidy(height, params),
        salt,
    )
}

/// Mine on `parent` but stamp the block for an explicit `height` (the
/// coinbase commitment and validation context use the claimed height).
pub fn mine_child_at(
    params: &ChainParams,
    parent: &ChainedHeader,
    height: u32,
    txs: Vec<Transaction>,
    salt: u32,
) -> Block {
    assemble(
        params,
        parent.hash,
        height,
        txs,
        subsidy::block_subsidy(height, params),
        salt,
    )
}

/// Mine with an explicit coinbase reward (for subsidy-violation cases).
pub fn mine_child_with_reward(
    params: &ChainParams,
    parent: &ChainedHeader,
    txs: Vec<Transaction>,
    reward: u64,
) -> Block {
    assemble(params, parent.hash, parent.height + 1, txs, reward, 0)
}

/// Re-solve the proof of work after the header has been edited.
pub fn remine(_params: &ChainParams, block: &mut Block) {
    solve(&mut block.header);
}

/// Validation context for a test block on a non-retargeting chain.
pub fn context_for(params: &ChainParams, block: &Block, height: u32) -> BlockContext {
    BlockContext {
        hash: block.block_hash(),
        height,
        header: block.header,
        expected_bits: params.genesis.header.bits,
    }
}

/// Where a known transaction's outputs live, for resolving test spends.
#[derive(Debug, Clone)]
pub struct TxResolution {
    pub txid: Txid,
    pub height: u32,
    pub is_coinbase: bool,
    pub outputs: Vec<TxOut>,
}

/// Resolutions for every transaction in `block`, assumed confirmed at
/// `height`.
pub fn resolutions_for(block: &Block, height: u32) -> Vec<TxResolution> {
    block
        .txdata
        .iter()
        .enumerate()
        .map(|(index, tx)| TxResolution {
            txid: tx.compute_txid(),
            height,
            is_coinbase: index == 0,
            outputs: tx.output.clone(),
        })
        .collect()
}

/// Turn a block into the validator's input stream, resolving inputs against
/// the supplied resolutions. Unresolvable inputs get a zero-value
/// placeholder so structural failures can still be exercised.
pub fn validatable_txs(block: &Block, resolutions: &[TxResolution]) -> Vec<ValidatableTx> {
    block
        .txdata
        .iter()
        .enumerate()
        .map(|(index, tx)| {
            let prev_outputs = if index == 0 {
                Vec::new()
            } else {
                tx.input
                    .iter()
                    .map(|input| {
                        match resolutions
                            .iter()
                            .find(|r| r.txid == input.previous_output.txid)
                        {
                            Some(found) => PrevOutput {
                                output: found.outputs[input.previous_output.vout as usize].clone(),
                                height: found.height,
                                is_coinbase: found.is_coinbase,
                            },
                            None => PrevOutput {
                                output: TxOut {
                                    value: Amount::from_sat(0),
                                    script_pubkey: ScriptBuf::new(),
                                },
                                height: 0,
                                is_coinbase: false,
                            },
                        }
                    })
                    .collect()
            };
            ValidatableTx::new(index, tx.clone(), prev_outputs)
        })
        .collect()
}

/// Script verifier that accepts every input.
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify(
        &self,
        _script_pubkey: &Script,
        _tx: &Transaction,
        _input_index: usize,
        _script_sig: &Script,
        _flags: ScriptFlags,
    ) -> bool {
        true
    }
}

/// Script verifier that rejects every input.
pub struct RejectAllScripts;

impl ScriptVerifier for RejectAllScripts {
    fn verify(
        &self,
        _script_pubkey: &Script,
        _tx: &Transaction,
        _input_index: usize,
        _script_sig: &Script,
        _flags: ScriptFlags,
    ) -> bool {
        false
    }
}

/// In-memory block body source.
pub struct MemoryBlockProvider {
    blocks: RwLock<HashMap<BlockHash, Block>>,
}

impl MemoryBlockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: RwLock::new(HashMap::new()),
        })
    }

    pub fn insert(&self, block: Block) {
        self.blocks.write().insert(block.block_hash(), block);
    }

    pub fn remove(&self, hash: &BlockHash) {
        self.blocks.write().remove(hash);
    }
}

#[async_trait]
impl BlockBodyProvider for MemoryBlockProvider {
    async fn fetch(&self, hash: &BlockHash) -> Result<Option<Block>, CoreError> {
        Ok(self.blocks.read().get(hash).cloned())
    }
}
