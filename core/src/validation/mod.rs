//! Pipelined per-block validation.
//!
//! [`BlockValidator::validate`] consumes a stream of [`ValidatableTx`] and
//! runs the four pipeline stages (merkle & uniqueness, structural &
//! accounting, contextual rules, script verdicts), then the whole-block
//! checks: merkle commitment, coinbase value against subsidy plus fees, the
//! BIP34 height commitment, and the difficulty schedule.

mod pipeline;
mod types;

pub use types::{PrevOutput, ValidatableTx};

use std::sync::Arc;

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, CompactTarget};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{BlockRuleError, CoreError};
use crate::params::ChainParams;
use crate::providers::ScriptVerifier;
use crate::subsidy;

use pipeline::{PipelineConfig, StageFailure};

/// Everything known about the block before its transactions stream through.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub hash: BlockHash,
    pub height: u32,
    pub header: BlockHeader,
    /// Compact bits the retarget schedule demands at this height.
    pub expected_bits: CompactTarget,
}

/// Whole-block facts gathered by a successful validation.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub fees: u64,
    pub tx_count: usize,
    pub block_size: usize,
    pub sigops: u32,
}

pub struct BlockValidator {
    params: Arc<ChainParams>,
    verifier: Arc<dyn ScriptVerifier>,
    parallelism: usize,
    ignore_script_errors: bool,
}

impl BlockValidator {
    pub fn new(params: Arc<ChainParams>, verifier: Arc<dyn ScriptVerifier>) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            params,
            verifier,
            parallelism,
            ignore_script_errors: false,
        }
    }

    /// Worker count for the parallel stages.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Downgrade script failures to warnings (historical-chain fast replay).
    pub fn with_ignore_script_errors(mut self, ignore: bool) -> Self {
        self.ignore_script_errors = ignore;
        self
    }

    /// Validate one block from its transaction stream.
    pub async fn validate(
        &self,
        ctx: &BlockContext,
        source: mpsc::Receiver<ValidatableTx>,
        cancel: CancelToken,
    ) -> Result<BlockSummary, CoreError> {
        let config = PipelineConfig {
            parallelism: self.parallelism,
            ignore_script_errors: self.ignore_script_errors,
            block_height: ctx.height,
            block_time: ctx.header.time,
            coinbase_maturity: self.params.coinbase_maturity,
        };

        let outcome = pipeline::run(config, self.verifier.clone(), source, cancel)
            .await
            .map_err(|failure| match failure {
                StageFailure::Rule(rule) => CoreError::validation(ctx.hash, rule),
                StageFailure::Cancelled => CoreError::Cancelled,
            })?;

        if outcome.tx_count == 0 {
            return Err(CoreError::validation(ctx.hash, BlockRuleError::MissingCoinbase));
        }

        // a truncated stream (duplicate txid) can never satisfy the header
        if outcome.repeated || outcome.computed_root != ctx.header.merkle_root {
            return Err(CoreError::validation(
                ctx.hash,
                BlockRuleError::MerkleRootMismatch {
                    expected: ctx.header.merkle_root,
                    computed: outcome.computed_root,
                },
            ));
        }

        let fees = outcome
            .total_input_value
            .saturating_sub(outcome.total_output_value);
        let allowed = subsidy::block_subsidy(ctx.height, &self.params) + fees;
        if outcome.coinbase_value > allowed {
            return Err(CoreError::validation(
                ctx.hash,
                BlockRuleError::BadSubsidy {
                    claimed: outcome.coinbase_value,
                    allowed,
                },
            ));
        }

        if self.params.enforces_bip34(ctx.height) {
            let commits = outcome
                .coinbase_script_sig
                .as_ref()
                .is_some_and(|script_sig| {
                    script_sig
                        .as_bytes()
                        .starts_with(&subsidy::height_commitment(ctx.height))
                });
            if !commits {
                return Err(CoreError::validation(
                    ctx.hash,
                    BlockRuleError::BadCoinbaseHeight { height: ctx.height },
                ));
            }
        }

        if ctx.header.bits != ctx.expected_bits {
            return Err(CoreError::validation(ctx.hash, BlockRuleError::BadDifficulty));
        }

        debug!(
            hash = %ctx.hash,
            height = ctx.height,
            txs = outcome.tx_count,
            size = outcome.block_size,
            sigops = outcome.sigops,
            "block validated"
        );

        Ok(BlockSummary {
            fees,
            tx_count: outcome.tx_count,
            block_size: outcome.block_size,
            sigops: outcome.sigops,
        })
    }
}
