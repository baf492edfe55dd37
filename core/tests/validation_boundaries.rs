//! Exact-limit behavior of the block validator: the size, sig-op, money,
//! and coinbase-script bounds sit on their specified edges.

use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header as BlockHeader, Version as BlockVersion};
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use tokio::sync::mpsc;

use consensus_core::constants::{COIN, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_MONEY};
use consensus_core::testkit::{self, AcceptAllScripts, TxResolution};
use consensus_core::{
    BlockRuleError, BlockSummary, BlockValidator, CancelToken, ChainParams, CoreError,
};

fn coinbase_with(script_sig: Vec<u8>, output: TxOut) -> Transaction {
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![output],
    }
}

/// Assemble an unmined block (the validator does not check proof of work).
fn block_of(params: &ChainParams, txdata: Vec<Transaction>) -> Block {
    let txids: Vec<_> = txdata.iter().map(|tx| tx.compute_txid()).collect();
    Block {
        header: BlockHeader {
            version: BlockVersion::from_consensus(2),
            prev_blockhash: params.genesis.header.block_hash(),
            merkle_root: consensus_core::merkle::merkle_root(&txids),
            time: params.genesis.header.time + 600,
            bits: params.genesis.header.bits,
            nonce: 0,
        },
        txdata,
    }
}

async fn validate(
    params: &Arc<ChainParams>,
    block: &Block,
    height: u32,
    resolutions: &[TxResolution],
) -> Result<BlockSummary, CoreError> {
    let validator =
        BlockValidator::new(params.clone(), Arc::new(AcceptAllScripts)).with_parallelism(2);
    let ctx = testkit::context_for(params, block, height);
    let txs = testkit::validatable_txs(block, resolutions);
    let (feed, source) = mpsc::channel(8);
    let send = async move {
        for tx in txs {
            if feed.send(tx).await.is_err() {
                break;
            }
        }
    };
    let (_, result) = tokio::join!(send, validator.validate(&ctx, source, CancelToken::new()));
    result
}

fn rule_of(error: CoreError) -> BlockRuleError {
    match error {
        CoreError::Validation { rule, .. } => rule,
        other => panic!("expected a validation error, got {other:?}"),
    }
}

/// One coinbase padded so the serialized block is exactly `size` bytes.
fn block_of_exact_size(params: &ChainParams, size: usize) -> Block {
    let mut pad = size.saturating_sub(200);
    loop {
        let coinbase = coinbase_with(
            vec![0x00, 0x00],
            TxOut {
                value: Amount::from_sat(50 * COIN),
                // OP_0 padding carries no sig-ops
                script_pubkey: ScriptBuf::from_bytes(vec![0x00; pad]),
            },
        );
        let encoded = bitcoin::consensus::encode::serialize(&coinbase).len();
        let block_size = 80 + 1 + encoded; // var-int tx count of one
        if block_size == size {
            return block_of(params, vec![coinbase]);
        }
        pad = (pad + size) - block_size;
    }
}

#[tokio::test]
async fn block_size_limit_is_exact() {
    let params = Arc::new(testkit::test_params());

    let at_limit = block_of_exact_size(&params, MAX_BLOCK_SIZE);
    let summary = validate(&params, &at_limit, 1, &[]).await.unwrap();
    assert_eq!(summary.block_size, MAX_BLOCK_SIZE);

    let over = block_of_exact_size(&params, MAX_BLOCK_SIZE + 1);
    let rule = rule_of(validate(&params, &over, 1, &[]).await.unwrap_err());
    assert!(
        matches!(rule, BlockRuleError::SizeLimit { size, .. } if size == MAX_BLOCK_SIZE + 1),
        "got {rule:?}"
    );
}

#[tokio::test]
async fn sigop_limit_is_exact() {
    let params = Arc::new(testkit::test_params());

    let at_limit = block_of(
        &params,
        vec![coinbase_with(
            vec![0x00, 0x00],
            TxOut {
                value: Amount::from_sat(50 * COIN),
                script_pubkey: ScriptBuf::from_bytes(vec![0xac; MAX_BLOCK_SIGOPS as usize]),
            },
        )],
    );
    let summary = validate(&params, &at_limit, 1, &[]).await.unwrap();
    assert_eq!(summary.sigops, MAX_BLOCK_SIGOPS);

    let over = block_of(
        &params,
        vec![coinbase_with(
            vec![0x00, 0x00],
            TxOut {
                value: Amount::from_sat(50 * COIN),
                script_pubkey: ScriptBuf::from_bytes(vec![0xac; MAX_BLOCK_SIGOPS as usize + 1]),
            },
        )],
    );
    let rule = rule_of(validate(&params, &over, 1, &[]).await.unwrap_err());
    assert!(matches!(rule, BlockRuleError::SigOpLimit { .. }), "got {rule:?}");
}

#[tokio::test]
async fn output_value_limit_is_exact() {
    let params = Arc::new(testkit::test_params());
    let genesis = testkit::genesis_header(&params);
    let funding_block = testkit::mine_child(&params, &genesis, vec![]);
    let funding = &funding_block.txdata[0];

    let build = |value: u64| {
        let mut spend = testkit::spend(funding, 0, value);
        spend.output[0].value = Amount::from_sat(value);
        let coinbase = coinbase_with(
            vec![0x00, 0x00],
            TxOut {
                value: Amount::from_sat(50 * COIN),
                script_pubkey: testkit::anyone_can_spend(),
            },
        );
        block_of(&params, vec![coinbase, spend])
    };
    // pretend the funding output carries the full money supply
    let resolution = |value: u64| {
        vec![TxResolution {
            txid: funding.compute_txid(),
            height: 1,
            is_coinbase: false,
            outputs: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: testkit::anyone_can_spend(),
            }],
        }]
    };

    validate(&params, &build(MAX_MONEY), 2, &resolution(MAX_MONEY))
        .await
        .unwrap();

    let rule = rule_of(
        validate(
            &params,
            &build(MAX_MONEY + 1),
            2,
            &resolution(MAX_MONEY + 1),
        )
        .await
        .unwrap_err(),
    );
    assert!(
        matches!(rule, BlockRuleError::OutputValueOutOfRange { .. }),
        "got {rule:?}"
    );
}

#[tokio::test]
async fn bip34_height_commitment_is_enforced_from_activation() {
    let mut raw = testkit::test_params();
    raw.bip34_height = 1;
    let params = Arc::new(raw);
    let genesis = testkit::genesis_header(&params);

    // the testkit coinbase commits to its height, so a mined block passes
    let committing = testkit::mine_child(&params, &genesis, vec![]);
    validate(&params, &committing, 1, &[]).await.unwrap();

    // a coinbase without the commitment fails once BIP34 is active
    let bare = block_of(
        &params,
        vec![coinbase_with(
            vec![0x00, 0x00],
            TxOut {
                value: Amount::from_sat(50 * COIN),
                script_pubkey: testkit::anyone_can_spend(),
            },
        )],
    );
    let rule = rule_of(validate(&params, &bare, 1, &[]).await.unwrap_err());
    assert!(
        matches!(rule, BlockRuleError::BadCoinbaseHeight { height: 1 }),
        "got {rule:?}"
    );
}

#[tokio::test]
async fn non_final_transactions_are_rejected() {
    let params = Arc::new(testkit::test_params());
    let genesis = testkit::genesis_header(&params);
    let funding_block = testkit::mine_child(&params, &genesis, vec![]);
    let funding = &funding_block.txdata[0];

    let mut locked = testkit::spend(funding, 0, 50 * COIN);
    // height-interpreted lock in the future, with a sequence that keeps the
    // lock active
    locked.lock_time = LockTime::from_consensus(10);
    locked.input[0].sequence = Sequence::ZERO;
    let coinbase = coinbase_with(
        vec![0x00, 0x00],
        TxOut {
            value: Amount::from_sat(50 * COIN),
            script_pubkey: testkit::anyone_can_spend(),
        },
    );
    let block = block_of(&params, vec![coinbase, locked]);
    let resolutions = testkit::resolutions_for(&funding_block, 1);

    let rule = rule_of(validate(&params, &block, 2, &resolutions).await.unwrap_err());
    assert!(matches!(rule, BlockRuleError::NonFinal { .. }), "got {rule:?}");
}

#[tokio::test]
async fn coinbase_script_sig_bounds_are_exact() {
    let params = Arc::new(testkit::test_params());
    let fifty = || TxOut {
        value: Amount::from_sat(50 * COIN),
        script_pubkey: testkit::anyone_can_spend(),
    };

    for len in [2usize, 100] {
        let block = block_of(&params, vec![coinbase_with(vec![0x00; len], fifty())]);
        validate(&params, &block, 1, &[]).await.unwrap();
    }
    for len in [1usize, 101] {
        let block = block_of(&params, vec![coinbase_with(vec![0x00; len], fifty())]);
        let rule = rule_of(validate(&params, &block, 1, &[]).await.unwrap_err());
        assert!(
            matches!(rule, BlockRuleError::CoinbaseScriptSize { len: seen } if seen == len),
            "got {rule:?}"
        );
    }
}
