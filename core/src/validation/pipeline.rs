//! The four-stage validation pipeline.
//!
//! Stages are linked by bounded channels: a full downstream queue throttles
//! the producer, and a closed upstream propagates completion. A consensus
//! fault at any stage trips the shared cancel token so the other stages stop
//! dequeueing and drain out.
//!
//! Stage A (merkle & uniqueness) and stage B (structural & accounting) are
//! sequential; stages C (contextual) and D (script verdicts) fan out across
//! workers that pull from a shared queue.

use std::sync::Arc;

use dashmap::DashSet;
use bitcoin::{OutPoint, ScriptBuf, TxMerkleNode};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::constants::{
    BIP16_SWITCH_TIME, COINBASE_SCRIPT_SIG_MAX, COINBASE_SCRIPT_SIG_MIN, LOCKTIME_THRESHOLD,
    MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_MONEY,
};
use crate::error::BlockRuleError;
use crate::merkle::MerkleBuilder;
use crate::providers::{ScriptFlags, ScriptVerifier};
use crate::sigops;
use crate::validation::types::ValidatableTx;

/// Depth of the inter-stage queues.
const QUEUE_DEPTH: usize = 64;

/// Why a stage stopped early.
#[derive(Debug)]
pub(crate) enum StageFailure {
    Rule(BlockRuleError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    pub parallelism: usize,
    pub ignore_script_errors: bool,
    pub block_height: u32,
    pub block_time: u32,
    pub coinbase_maturity: u32,
}

impl PipelineConfig {
    fn p2sh_active(&self) -> bool {
        self.block_time >= BIP16_SWITCH_TIME
    }
}

/// Everything the post-pipeline block checks need.
#[derive(Debug)]
pub(crate) struct PipelineOutcome {
    pub computed_root: TxMerkleNode,
    pub repeated: bool,
    pub tx_count: usize,
    pub block_size: usize,
    pub sigops: u32,
    pub total_input_value: u64,
    pub total_output_value: u64,
    pub coinbase_value: u64,
    pub coinbase_script_sig: Option<ScriptBuf>,
}

fn var_int_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Receive from a stage input, aborting when the shared token trips.
async fn recv_or_cancel<T>(
    rx: &mut mpsc::Receiver<T>,
    cancel: &CancelToken,
) -> Result<Option<T>, StageFailure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageFailure::Cancelled),
        item = rx.recv() => Ok(item),
    }
}

/// Shared-queue variant for the parallel stages.
async fn recv_shared<T>(
    rx: &AsyncMutex<mpsc::Receiver<T>>,
    cancel: &CancelToken,
) -> Result<Option<T>, StageFailure> {
    let mut guard = rx.lock().await;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageFailure::Cancelled),
        item = guard.recv() => Ok(item),
    }
}

/// Stage A: merkle accumulation and duplicate-hash truncation.
///
/// A repeated txid stops the stage without fault; dropping the stage input
/// makes the feeder stop, and the truncated stream fails the merkle
/// commitment at finalization.
async fn stage_merkle(
    mut source: mpsc::Receiver<ValidatableTx>,
    downstream: mpsc::Sender<Arc<ValidatableTx>>,
    cancel: CancelToken,
) -> Result<(TxMerkleNode, bool, usize), StageFailure> {
    let mut builder = MerkleBuilder::new();
    while let Some(tx) = recv_or_cancel(&mut source, &cancel).await? {
        if !builder.push(tx.txid) {
            break;
        }
        if downstream.send(Arc::new(tx)).await.is_err() {
            // downstream faulted; the token is already tripping
            return Err(StageFailure::Cancelled);
        }
    }
    Ok((builder.finalize(), builder.repeated(), builder.len()))
}

struct Accounting {
    block_size: usize,
    body_size: usize,
    sigops: u32,
    total_input_value: u64,
    total_output_value: u64,
    coinbase_value: u64,
    coinbase_script_sig: Option<ScriptBuf>,
    tx_count: usize,
}

/// Stage B: structural rules and running block-level accounting.
async fn stage_structural(
    config: PipelineConfig,
    mut upstream: mpsc::Receiver<Arc<ValidatableTx>>,
    downstream: mpsc::Sender<Arc<ValidatableTx>>,
    cancel: CancelToken,
) -> Result<Accounting, StageFailure> {
    let mut acc = Accounting {
        block_size: 80,
        body_size: 0,
        sigops: 0,
        total_input_value: 0,
        total_output_value: 0,
        coinbase_value: 0,
        coinbase_script_sig: None,
        tx_count: 0,
    };

    let fail = |rule: BlockRuleError, cancel: &CancelToken| {
        cancel.cancel();
        StageFailure::Rule(rule)
    };

    while let Some(vtx) = recv_or_cancel(&mut upstream, &cancel).await? {
        let tx = &vtx.tx;
        let txid = vtx.txid;

        if vtx.index == 0 {
            if !tx.is_coinbase() {
                return Err(fail(BlockRuleError::MissingCoinbase, &cancel));
            }
        } else if tx.is_coinbase() {
            return Err(fail(BlockRuleError::UnexpectedCoinbase { index: vtx.index }, &cancel));
        }

        if tx.input.is_empty() {
            return Err(fail(BlockRuleError::EmptyInputs { txid }, &cancel));
        }
        if tx.output.is_empty() {
            return Err(fail(BlockRuleError::EmptyOutputs { txid }, &cancel));
        }

        let mut output_total = 0u64;
        for (vout, output) in tx.output.iter().enumerate() {
            let value = output.value.to_sat();
            if value > MAX_MONEY {
                return Err(fail(
                    BlockRuleError::OutputValueOutOfRange {
                        txid,
                        vout: vout as u32,
                    },
                    &cancel,
                ));
            }
            output_total = match output_total.checked_add(value) {
                Some(total) if total <= MAX_MONEY => total,
                _ => return Err(fail(BlockRuleError::AccountingOverflow { txid }, &cancel)),
            };
        }

        if vtx.is_coinbase() {
            let len = tx.input[0].script_sig.len();
            if !(COINBASE_SCRIPT_SIG_MIN..=COINBASE_SCRIPT_SIG_MAX).contains(&len) {
                return Err(fail(BlockRuleError::CoinbaseScriptSize { len }, &cancel));
            }
            acc.coinbase_value = output_total;
            acc.coinbase_script_sig = Some(tx.input[0].script_sig.clone());
        } else {
            for (index, input) in tx.input.iter().enumerate() {
                if input.previous_output.is_null() {
                    return Err(fail(BlockRuleError::NullPrevOutput { txid, index }, &cancel));
                }
            }
        }

        // running sig-op total: legacy over every script, P2SH on top once
        // the switch time has passed
        for output in &tx.output {
            acc.sigops += sigops::count_legacy_sigops(&output.script_pubkey);
        }
        for input in &tx.input {
            acc.sigops += sigops::count_legacy_sigops(&input.script_sig);
        }
        if config.p2sh_active() && !vtx.is_coinbase() {
            for (input, prev) in tx.input.iter().zip(&vtx.prev_outputs) {
                acc.sigops +=
                    sigops::count_p2sh_sigops(&prev.output.script_pubkey, &input.script_sig);
            }
        }
        if acc.sigops > MAX_BLOCK_SIGOPS {
            return Err(fail(
                BlockRuleError::SigOpLimit {
                    count: acc.sigops,
                    limit: MAX_BLOCK_SIGOPS,
                },
                &cancel,
            ));
        }

        // running encoded size, var-int tx count included
        acc.tx_count += 1;
        acc.body_size += vtx.tx_bytes.len();
        acc.block_size = 80 + var_int_len(acc.tx_count as u64) + acc.body_size;
        if acc.block_size > MAX_BLOCK_SIZE {
            return Err(fail(
                BlockRuleError::SizeLimit {
                    size: acc.block_size,
                    limit: MAX_BLOCK_SIZE,
                },
                &cancel,
            ));
        }

        if !vtx.is_coinbase() {
            let input_total = vtx.input_value();
            acc.total_input_value = match acc
                .total_input_value
                .checked_add(u64::try_from(input_total).unwrap_or(u64::MAX))
            {
                Some(total) => total,
                None => return Err(fail(BlockRuleError::AccountingOverflow { txid }, &cancel)),
            };
            acc.total_output_value = match acc.total_output_value.checked_add(output_total) {
                Some(total) => total,
                None => return Err(fail(BlockRuleError::AccountingOverflow { txid }, &cancel)),
            };
        }

        if downstream.send(vtx).await.is_err() {
            return Err(StageFailure::Cancelled);
        }
    }

    Ok(acc)
}

/// Stage C worker: contextual transaction rules; emits one script work item
/// per input.
async fn stage_contextual(
    config: PipelineConfig,
    upstream: Arc<AsyncMutex<mpsc::Receiver<Arc<ValidatableTx>>>>,
    downstream: mpsc::Sender<(Arc<ValidatableTx>, usize)>,
    spent_in_block: Arc<DashSet<OutPoint>>,
    cancel: CancelToken,
) -> Result<(), StageFailure> {
    let fail = |rule: BlockRuleError| {
        cancel.cancel();
        StageFailure::Rule(rule)
    };

    while let Some(vtx) = recv_shared(&upstream, &cancel).await? {
        if vtx.is_coinbase() {
            continue;
        }
        let tx = &vtx.tx;
        debug_assert_eq!(tx.input.len(), vtx.prev_outputs.len());

        for (input, prev) in tx.input.iter().zip(&vtx.prev_outputs) {
            if prev.is_coinbase
                && config.block_height.saturating_sub(prev.height) < config.coinbase_maturity
            {
                return Err(fail(BlockRuleError::CoinbaseImmaturity {
                    outpoint: input.previous_output,
                    spend_height: config.block_height,
                }));
            }
            if !spent_in_block.insert(input.previous_output) {
                return Err(fail(BlockRuleError::DoubleSpendWithinBlock {
                    outpoint: input.previous_output,
                }));
            }
        }

        let lock_time = tx.lock_time.to_consensus_u32();
        if lock_time != 0 {
            let cutoff = if lock_time < LOCKTIME_THRESHOLD {
                config.block_height as u64
            } else {
                config.block_time as u64
            };
            let final_by_time = (lock_time as u64) < cutoff;
            let final_by_sequence = tx
                .input
                .iter()
                .all(|input| input.sequence == bitcoin::Sequence::MAX);
            if !final_by_time && !final_by_sequence {
                return Err(fail(BlockRuleError::NonFinal { txid: vtx.txid }));
            }
        }

        let input_value = vtx.input_value();
        let output_value = vtx.output_value();
        if input_value < output_value {
            return Err(fail(BlockRuleError::InputsBelowOutputs { txid: vtx.txid }));
        }
        if input_value - output_value > MAX_MONEY as u128 {
            return Err(fail(BlockRuleError::FeeOutOfRange { txid: vtx.txid }));
        }

        for index in 0..tx.input.len() {
            if downstream.send((vtx.clone(), index)).await.is_err() {
                return Err(StageFailure::Cancelled);
            }
        }
    }
    Ok(())
}

/// Stage D worker: external script verdict per (tx, input).
async fn stage_scripts(
    config: PipelineConfig,
    upstream: Arc<AsyncMutex<mpsc::Receiver<(Arc<ValidatableTx>, usize)>>>,
    verifier: Arc<dyn ScriptVerifier>,
    cancel: CancelToken,
) -> Result<(), StageFailure> {
    let flags = ScriptFlags {
        verify_p2sh: config.p2sh_active(),
    };
    while let Some((vtx, index)) = recv_shared(&upstream, &cancel).await? {
        let input = &vtx.tx.input[index];
        let prev = &vtx.prev_outputs[index];
        let valid = verifier.verify(
            &prev.output.script_pubkey,
            &vtx.tx,
            index,
            &input.script_sig,
            flags,
        );
        if !valid {
            if config.ignore_script_errors {
                warn!(txid = %vtx.txid, input = index, "ignoring script verification failure");
            } else {
                cancel.cancel();
                return Err(StageFailure::Rule(BlockRuleError::ScriptInvalid {
                    txid: vtx.txid,
                    index,
                }));
            }
        }
    }
    Ok(())
}

/// Run the four stages to completion over `source`.
pub(crate) async fn run(
    config: PipelineConfig,
    verifier: Arc<dyn ScriptVerifier>,
    source: mpsc::Receiver<ValidatableTx>,
    cancel: CancelToken,
) -> Result<PipelineOutcome, StageFailure> {
    let parallelism = config.parallelism.max(1);

    let (to_b, from_a) = mpsc::channel(QUEUE_DEPTH);
    let (to_c, from_b) = mpsc::channel(QUEUE_DEPTH);
    let (to_d, from_c) = mpsc::channel(QUEUE_DEPTH);

    let stage_a = tokio::spawn(stage_merkle(source, to_b, cancel.clone()));
    let stage_b = tokio::spawn(stage_structural(
        config.clone(),
        from_a,
        to_c,
        cancel.clone(),
    ));

    let from_b = Arc::new(AsyncMutex::new(from_b));
    let spent_in_block = Arc::new(DashSet::new());
    let stage_c: Vec<_> = (0..parallelism)
        .map(|_| {
            tokio::spawn(stage_contextual(
                config.clone(),
                from_b.clone(),
                to_d.clone(),
                spent_in_block.clone(),
                cancel.clone(),
            ))
        })
        .collect();
    drop(to_d);

    let from_c = Arc::new(AsyncMutex::new(from_c));
    let stage_d: Vec<_> = (0..parallelism)
        .map(|_| {
            tokio::spawn(stage_scripts(
                config.clone(),
                from_c.clone(),
                verifier.clone(),
                cancel.clone(),
            ))
        })
        .collect();

    let a_result = stage_a.await.expect("merkle stage panicked");
    let b_result = stage_b.await.expect("structural stage panicked");

    // a consensus fault beats the cancellations it caused downstream
    let mut failure: Option<StageFailure> = None;
    let acc = match b_result {
        Ok(acc) => Some(acc),
        Err(b_failure) => {
            failure = Some(b_failure);
            None
        }
    };
    for handle in stage_c.into_iter().chain(stage_d) {
        if let Err(worker_failure) = handle.await.expect("validation worker panicked") {
            failure = Some(match failure.take() {
                Some(existing) => prefer_failure(existing, worker_failure),
                None => worker_failure,
            });
        }
    }
    if let Some(failure) = failure {
        return Err(failure);
    }
    let (computed_root, repeated, merkle_leaves) = a_result?;
    let acc = acc.expect("structural stage completed");
    debug_assert_eq!(merkle_leaves, acc.tx_count);

    Ok(PipelineOutcome {
        computed_root,
        repeated,
        tx_count: acc.tx_count,
        block_size: acc.block_size,
        sigops: acc.sigops,
        total_input_value: acc.total_input_value,
        total_output_value: acc.total_output_value,
        coinbase_value: acc.coinbase_value,
        coinbase_script_sig: acc.coinbase_script_sig,
    })
}

fn prefer_failure(existing: StageFailure, new: StageFailure) -> StageFailure {
    if matches!(existing, StageFailure::Rule(_)) {
        existing
    } else {
        new
    }
}
