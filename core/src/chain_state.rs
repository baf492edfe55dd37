//! Chain state management.
//!
//! The manager owns the live chain tip and is the only writer of the UTXO
//! store. It reacts to target-chain changes by computing a reorg plan,
//! unwinding stale blocks via their undo data and advancing target blocks
//! through the validator, committing exactly once per block. A block that
//! fails validation is blacklisted, the target is re-selected, and the loop
//! retries against the shorter candidate set.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{Block, Txid};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use storage::{BlockUndoData, ChainStateStore, OutputState, SpentOutputUndo};

use crate::cancel::CancelToken;
use crate::chain::{Chain, ChainedHeader};
use crate::chain_index::ChainIndex;
use crate::difficulty;
use crate::error::{BlockRuleError, CoreError};
use crate::events::{EventBus, NodeEvent};
use crate::invalid_cache::InvalidBlockCache;
use crate::params::ChainParams;
use crate::providers::BlockBodyProvider;
use crate::target_chain::TargetChainSelector;
use crate::validation::{BlockContext, BlockValidator, PrevOutput, ValidatableTx};

const FEED_DEPTH: usize = 64;

/// Resolution by-products of one block: what it spends (with restore info)
/// and what it creates, in block order.
struct ResolvedBlock {
    spent: Vec<SpentOutputUndo>,
    created: Vec<(Txid, u32)>,
}

pub struct ChainStateManager {
    params: Arc<ChainParams>,
    index: Arc<ChainIndex>,
    selector: Arc<TargetChainSelector>,
    invalid: Arc<InvalidBlockCache>,
    store: Arc<ChainStateStore>,
    provider: Arc<dyn BlockBodyProvider>,
    validator: BlockValidator,
    events: Arc<EventBus>,
    current: RwLock<Arc<Chain>>,
    cancel: CancelToken,
}

impl ChainStateManager {
    /// Open the manager, anchoring the store at genesis on first run or
    /// re-materializing the persisted tip's chain from the header index.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        params: Arc<ChainParams>,
        index: Arc<ChainIndex>,
        selector: Arc<TargetChainSelector>,
        invalid: Arc<InvalidBlockCache>,
        store: Arc<ChainStateStore>,
        provider: Arc<dyn BlockBodyProvider>,
        validator: BlockValidator,
        events: Arc<EventBus>,
    ) -> Result<Self, CoreError> {
        let current = match store.chain_tip()? {
            Some(tip) => index.chain_to(&tip)?,
            None => {
                let genesis = index.genesis().clone();
                let mut cursor = store.begin(false);
                cursor.set_chain_tip(&genesis.hash)?;
                cursor.commit()?;
                info!(hash = %genesis.hash, "initialized chain state at genesis");
                Chain::new(genesis)
            }
        };

        Ok(Self {
            params,
            index,
            selector,
            invalid,
            store,
            provider,
            validator,
            events,
            current: RwLock::new(Arc::new(current)),
            cancel: CancelToken::new(),
        })
    }

    pub fn current_chain(&self) -> Arc<Chain> {
        self.current.read().clone()
    }

    pub fn chain_tip(&self) -> ChainedHeader {
        self.current_chain().tip().clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Long-lived daemon: catch up, then sleep until the target changes.
    pub async fn run(&self) -> Result<(), CoreError> {
        let signal = self.selector.change_signal();
        loop {
            match self.catch_up().await {
                Ok(()) => {}
                Err(CoreError::Cancelled) => return Ok(()),
                Err(e) => {
                    error!(error = %e, "chain state manager stopping");
                    return Err(e);
                }
            }
            tokio::select! {
                _ = signal.notified() => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Drive the live tip to the selector's target chain. Returns once the
    /// tips agree, or once progress is blocked on a missing block body.
    pub async fn catch_up(&self) -> Result<(), CoreError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let target = self.selector.target_chain();
            let current = self.current_chain();
            if target.tip().hash == current.tip().hash {
                return Ok(());
            }

            let plan = current.reorg_plan(&target);
            if !plan.rewind.is_empty() {
                info!(
                    from = %current.tip().hash,
                    to = %target.tip().hash,
                    fork = plan.common_ancestor.height,
                    rewind = plan.rewind.len(),
                    advance = plan.advance.len(),
                    "reorganizing chain"
                );
            }

            for header in &plan.rewind {
                self.rewind_block(header)?;
            }

            for header in &plan.advance {
                if self.cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                match self.advance_block(&target, header).await {
                    Ok(()) => {}
                    Err(CoreError::Validation { hash, rule }) => {
                        self.invalid.add(&hash, &rule.to_string())?;
                        self.selector.rescan()?;
                        break;
                    }
                    Err(CoreError::MissingBlock(hash)) => {
                        debug!(%hash, "block body not yet available; deferring reorg");
                        return Ok(());
                    }
                    Err(other) => return Err(other),
                }
            }
        }
    }

    /// Resolve a block's previous outputs against the committed UTXO set and
    /// the block's own earlier transactions.
    fn resolve_block(
        &self,
        block: &Block,
        height: u32,
    ) -> Result<(Vec<ValidatableTx>, ResolvedBlock), CoreError> {
        let cursor = self.store.begin(true);
        let mut in_block: HashMap<Txid, usize> = HashMap::new();
        let mut txs = Vec::with_capacity(block.txdata.len());
        let mut spent = Vec::new();
        let mut created = Vec::with_capacity(block.txdata.len());

        for (index, tx) in block.txdata.iter().enumerate() {
            let txid = tx.compute_txid();
            let mut prev_outputs = Vec::new();

            if index > 0 {
                for input in &tx.input {
                    let outpoint = input.previous_output;
                    if let Some(&creator_index) = in_block.get(&outpoint.txid) {
                        let creator = &block.txdata[creator_index];
                        let output = creator
                            .output
                            .get(outpoint.vout as usize)
                            .ok_or_else(|| {
                                CoreError::validation(
                                    block.block_hash(),
                                    BlockRuleError::PrevOutputMissing { outpoint },
                                )
                            })?
                            .clone();
                        prev_outputs.push(PrevOutput {
                            output: output.clone(),
                            height,
                            is_coinbase: creator_index == 0,
                        });
                        spent.push(SpentOutputUndo {
                            outpoint,
                            output,
                            block_height: height,
                            tx_index: creator_index as u32,
                            output_count: creator.output.len() as u32,
                        });
                    } else {
                        let Some(unspent) = cursor.try_get_unspent_tx(&outpoint.txid)? else {
                            return Err(CoreError::validation(
                                block.block_hash(),
                                BlockRuleError::PrevOutputMissing { outpoint },
                            ));
                        };
                        if outpoint.vout >= unspent.output_count()
                            || unspent.output_states.state(outpoint.vout) == OutputState::Spent
                        {
                            return Err(CoreError::validation(
                                block.block_hash(),
                                BlockRuleError::PrevOutputMissing { outpoint },
                            ));
                        }
                        let output =
                            cursor.try_get_unspent_output(&outpoint)?.ok_or_else(|| {
                                CoreError::Corrupt(format!(
                                    "unspent tx row for {outpoint} has no output payload"
                                ))
                            })?;
                        prev_outputs.push(PrevOutput {
                            output: output.clone(),
                            height: unspent.block_height,
                            is_coinbase: unspent.is_coinbase(),
                        });
                        spent.push(SpentOutputUndo {
                            outpoint,
                            output,
                            block_height: unspent.block_height,
                            tx_index: unspent.tx_index,
                            output_count: unspent.output_count(),
                        });
                    }
                }
            }

            created.push((txid, tx.output.len() as u32));
            in_block.insert(txid, index);
            txs.push(ValidatableTx::new(index, tx.clone(), prev_outputs));
        }

        Ok((txs, ResolvedBlock { spent, created }))
    }

    /// Validate one target block and apply it under a single commit.
    async fn advance_block(
        &self,
        target: &Chain,
        header: &ChainedHeader,
    ) -> Result<(), CoreError> {
        let block = self
            .provider
            .fetch(&header.hash)
            .await?
            .ok_or(CoreError::MissingBlock(header.hash))?;
        if block.block_hash() != header.hash {
            return Err(CoreError::Corrupt(format!(
                "body provider returned {} for {}",
                block.block_hash(),
                header.hash
            )));
        }

        let expected_bits = difficulty::required_bits(&self.params, target, header.height)?;
        let ctx = BlockContext {
            hash: header.hash,
            height: header.height,
            header: header.header,
            expected_bits,
        };

        let (txs, resolved) = self.resolve_block(&block, header.height)?;
        let (feed, source) = mpsc::channel(FEED_DEPTH);
        let sender = async move {
            for tx in txs {
                if feed.send(tx).await.is_err() {
                    break;
                }
            }
        };
        let (_, validated) = tokio::join!(
            sender,
            self.validator.validate(&ctx, source, self.cancel.clone())
        );
        let summary = validated?;

        self.apply_block(&block, header, resolved)?;
        info!(
            hash = %header.hash,
            height = header.height,
            txs = summary.tx_count,
            fees = summary.fees,
            "block applied"
        );
        Ok(())
    }

    fn apply_block(
        &self,
        block: &Block,
        header: &ChainedHeader,
        resolved: ResolvedBlock,
    ) -> Result<(), CoreError> {
        let mut cursor = self.store.begin(false);
        let tip = cursor.chain_tip()?;
        if tip != Some(header.prev_hash()) {
            return Err(CoreError::Corrupt(format!(
                "store tip {tip:?} does not precede block {}",
                header.hash
            )));
        }

        for (index, ((txid, _), tx)) in resolved.created.iter().zip(&block.txdata).enumerate() {
            if !cursor.try_add_unspent_tx(txid, header.height, index as u32, &tx.output)? {
                // duplicate txid within the chain supersedes the earlier row
                cursor.try_remove_unspent_tx(txid)?;
                cursor.try_add_unspent_tx(txid, header.height, index as u32, &tx.output)?;
            }
        }
        for spend in &resolved.spent {
            match cursor.try_spend_output(&spend.outpoint)? {
                Some(OutputState::Unspent) => {}
                other => {
                    return Err(CoreError::Corrupt(format!(
                        "validated spend of {} found state {other:?}",
                        spend.outpoint
                    )));
                }
            }
        }

        let mut undo = BlockUndoData::new(header.hash, header.height);
        undo.spent = resolved.spent;
        undo.created = resolved.created;
        cursor.put_block_undo(&undo)?;
        cursor.set_chain_tip(&header.hash)?;
        cursor.commit()?;

        let extended = {
            let current = self.current_chain();
            let mut chain = (*current).clone();
            chain.push(header.clone())?;
            Arc::new(chain)
        };
        *self.current.write() = extended;

        self.events.publish(NodeEvent::BlockApplied {
            hash: header.hash,
            height: header.height,
            header: header.header,
        });
        self.events.publish(NodeEvent::ChainTipAdvanced {
            tip: header.hash,
            height: header.height,
        });
        Ok(())
    }

    /// Reverse one block using its undo data and roll the tip back.
    fn rewind_block(&self, header: &ChainedHeader) -> Result<(), CoreError> {
        if self.invalid.contains(&header.hash) {
            // the invalid flag arrived after the block was applied; the
            // stores no longer agree on history
            return Err(CoreError::Corrupt(format!(
                "applied block {} is blacklisted; reorg state is inconsistent",
                header.hash
            )));
        }
        let undo = self.store.block_undo(&header.hash)?.ok_or_else(|| {
            CoreError::Corrupt(format!("no undo data for applied block {}", header.hash))
        })?;

        let mut cursor = self.store.begin(false);
        if cursor.chain_tip()? != Some(header.hash) {
            return Err(CoreError::Corrupt(format!(
                "rewind of {} but store tip differs",
                header.hash
            )));
        }

        for spend in undo.spent.iter().rev() {
            cursor.unspend_output(
                &spend.outpoint,
                &spend.output,
                spend.block_height,
                spend.tx_index,
                spend.output_count,
            )?;
        }
        for (txid, _) in undo.created.iter().rev() {
            cursor.try_remove_unspent_tx(txid)?;
        }
        cursor.delete_block_undo(&header.hash)?;
        cursor.set_chain_tip(&header.prev_hash())?;
        cursor.commit()?;

        let truncated = {
            let current = self.current_chain();
            let mut chain = (*current).clone();
            chain.truncate_to(header.height - 1);
            Arc::new(chain)
        };
        *self.current.write() = truncated;

        info!(hash = %header.hash, height = header.height, "block unwound");
        self.events.publish(NodeEvent::BlockUnwound {
            hash: header.hash,
            height: header.height,
            header: header.header,
        });
        Ok(())
    }

    /// The index this manager resolves chains against.
    pub fn chain_index(&self) -> &Arc<ChainIndex> {
        &self.index
    }
}
