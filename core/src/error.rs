use bitcoin::{BlockHash, OutPoint, TxMerkleNode, Txid};
use thiserror::Error;

/// A consensus rule violated by a block under validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockRuleError {
    #[error("merkle root mismatch: header commits to {expected}, computed {computed}")]
    MerkleRootMismatch {
        expected: TxMerkleNode,
        computed: TxMerkleNode,
    },

    #[error("first transaction is not a coinbase")]
    MissingCoinbase,

    #[error("transaction {index} is an unexpected coinbase")]
    UnexpectedCoinbase { index: usize },

    #[error("transaction {txid} has no inputs")]
    EmptyInputs { txid: Txid },

    #[error("transaction {txid} has no outputs")]
    EmptyOutputs { txid: Txid },

    #[error("transaction {txid} output {vout} value exceeds the money supply")]
    OutputValueOutOfRange { txid: Txid, vout: u32 },

    #[error("transaction {txid} output total exceeds the money supply")]
    AccountingOverflow { txid: Txid },

    #[error("coinbase script signature length {len} outside 2..=100")]
    CoinbaseScriptSize { len: usize },

    #[error("transaction {txid} input {index} references the coinbase sentinel")]
    NullPrevOutput { txid: Txid, index: usize },

    #[error("block sig-op count {count} exceeds {limit}")]
    SigOpLimit { count: u32, limit: u32 },

    #[error("block size {size} exceeds {limit}")]
    SizeLimit { size: usize, limit: usize },

    #[error("script verification failed for transaction {txid} input {index}")]
    ScriptInvalid { txid: Txid, index: usize },

    #[error("output {outpoint} spent twice within the block")]
    DoubleSpendWithinBlock { outpoint: OutPoint },

    #[error("missing or already spent previous output {outpoint}")]
    PrevOutputMissing { outpoint: OutPoint },

    #[error("coinbase output {outpoint} spent at height {spend_height} before maturity")]
    CoinbaseImmaturity {
        outpoint: OutPoint,
        spend_height: u32,
    },

    #[error("transaction {txid} is not final for this block")]
    NonFinal { txid: Txid },

    #[error("transaction {txid} outputs exceed its inputs")]
    InputsBelowOutputs { txid: Txid },

    #[error("transaction {txid} fee exceeds the money supply")]
    FeeOutOfRange { txid: Txid },

    #[error("coinbase claims {claimed} but subsidy plus fees allow {allowed}")]
    BadSubsidy { claimed: u64, allowed: u64 },

    #[error("coinbase does not commit to height {height}")]
    BadCoinbaseHeight { height: u32 },

    #[error("difficulty bits do not match the retarget schedule")]
    BadDifficulty,
}

/// Errors surfaced by the consensus core.
///
/// `Validation` is recovered from by blacklisting the block and re-selecting
/// the target chain. `Corrupt` is fatal. `MissingBlock` never escapes the
/// chain-state worker; it defers the reorg until the body arrives.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("block {hash} failed validation: {rule}")]
    Validation { hash: BlockHash, rule: BlockRuleError },

    #[error("header {hash} extends unknown parent {parent}")]
    UnknownParent { hash: BlockHash, parent: BlockHash },

    #[error("header {hash} carries invalid work")]
    InvalidWork { hash: BlockHash },

    #[error("block body {0} not available")]
    MissingBlock(BlockHash),

    #[error("chain state corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn validation(hash: BlockHash, rule: BlockRuleError) -> Self {
        Self::Validation { hash, rule }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
