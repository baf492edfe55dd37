//! Mempool reconciliation against a live chain state.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::Block;

use consensus_core::chain::ChainedHeader;
use consensus_core::constants::COIN;
use consensus_core::testkit::{self, AcceptAllScripts, MemoryBlockProvider};
use consensus_core::{
    BlockValidator, ChainIndex, ChainParams, ChainStateManager, EventBus, InvalidBlockCache,
    TargetChainSelector,
};
use mempool::{AdmitOutcome, Mempool, RejectReason};
use storage::{ChainStateStore, Database, OutputState};

struct Harness {
    _db: Database,
    params: Arc<ChainParams>,
    index: Arc<ChainIndex>,
    selector: Arc<TargetChainSelector>,
    provider: Arc<MemoryBlockProvider>,
    store: Arc<ChainStateStore>,
    events: Arc<EventBus>,
    manager: ChainStateManager,
    pool: Arc<Mempool>,
}

fn harness() -> Harness {
    let db = Database::open_temporary().unwrap();
    let params = Arc::new(testkit::test_params());
    let events = Arc::new(EventBus::new());
    let index = Arc::new(ChainIndex::open(db.open_header_store().unwrap(), &params).unwrap());
    let invalid = Arc::new(
        InvalidBlockCache::open(db.open_invalid_block_store().unwrap(), events.clone()).unwrap(),
    );
    let selector =
        Arc::new(TargetChainSelector::open(index.clone(), invalid.clone(), events.clone()).unwrap());
    let provider = MemoryBlockProvider::new();
    let store = db.open_chain_state().unwrap();
    let validator =
        BlockValidator::new(params.clone(), Arc::new(AcceptAllScripts)).with_parallelism(2);
    let manager = ChainStateManager::open(
        params.clone(),
        index.clone(),
        selector.clone(),
        invalid,
        store.clone(),
        provider.clone(),
        validator,
        events.clone(),
    )
    .unwrap();
    let pool = Arc::new(
        Mempool::open(
            store.clone(),
            db.open_mempool_store().unwrap(),
            events.clone(),
            db.supports_concurrent_writers(),
        )
        .unwrap(),
    );
    Harness {
        _db: db,
        params,
        index,
        selector,
        provider,
        store,
        events,
        manager,
        pool,
    }
}

impl Harness {
    fn submit(&self, block: &Block) -> ChainedHeader {
        self.provider.insert(block.clone());
        self.selector.submit_header(block.header).unwrap()
    }

    async fn sync(&self) {
        self.manager.catch_up().await.unwrap();
    }

    /// Invariant: every mempool input resolves to an unspent UTXO entry.
    fn assert_inputs_unspent(&self) {
        let cursor = self.store.begin(true);
        for txid in self.pool.txids() {
            let entry = self.pool.get(&txid).unwrap();
            for input in &entry.tx.input {
                let outpoint = input.previous_output;
                let unspent = cursor
                    .try_get_unspent_tx(&outpoint.txid)
                    .unwrap()
                    .unwrap_or_else(|| panic!("mempool input {outpoint} not in UTXO"));
                assert_eq!(
                    unspent.output_states.state(outpoint.vout),
                    OutputState::Unspent,
                    "mempool input {outpoint} is spent on-chain"
                );
            }
        }
    }
}

#[tokio::test]
async fn confirmation_removes_pool_entries() -> anyhow::Result<()> {
    let h = harness();
    let genesis = h.index.genesis().clone();
    let b1 = testkit::mine_child(&h.params, &genesis, vec![]);
    let h1 = h.submit(&b1);
    h.sync().await;

    let spend = testkit::spend(&b1.txdata[0], 0, 50 * COIN);
    assert_eq!(h.pool.try_add(&spend)?, AdmitOutcome::Admitted);
    h.assert_inputs_unspent();

    // the block confirming the spend
    let b2 = testkit::mine_child(&h.params, &h1, vec![spend.clone()]);
    h.submit(&b2);
    h.sync().await;
    let (confirmed, conflicts) = h.pool.on_block_applied(&b2, 2)?;

    assert_eq!(confirmed, vec![spend.compute_txid()]);
    assert!(conflicts.is_empty());
    assert!(!h.pool.contains(&spend.compute_txid()));
    assert!(h.pool.is_empty());
    assert_eq!(h.pool.chain_tip(), Some(b2.block_hash()));
    Ok(())
}

#[tokio::test]
async fn conflicting_entries_are_evicted_on_confirmation() {
    let h = harness();
    let genesis = h.index.genesis().clone();
    let b1 = testkit::mine_child(&h.params, &genesis, vec![]);
    let h1 = h.submit(&b1);
    h.sync().await;

    // two pool spends of the same coinbase output
    let winner = testkit::spend(&b1.txdata[0], 0, 50 * COIN);
    let loser = testkit::spend(&b1.txdata[0], 0, 49 * COIN);
    assert_eq!(h.pool.try_add(&winner).unwrap(), AdmitOutcome::Admitted);
    assert_eq!(h.pool.try_add(&loser).unwrap(), AdmitOutcome::Admitted);
    assert_eq!(
        h.pool.get_spending(&winner.input[0].previous_output).len(),
        2
    );

    let b2 = testkit::mine_child(&h.params, &h1, vec![winner.clone()]);
    h.submit(&b2);
    h.sync().await;
    let (confirmed, conflicts) = h.pool.on_block_applied(&b2, 2).unwrap();

    assert_eq!(confirmed, vec![winner.compute_txid()]);
    assert_eq!(conflicts, vec![loser.compute_txid()]);
    assert!(h.pool.is_empty());
    assert!(h
        .pool
        .get_spending(&winner.input[0].previous_output)
        .is_empty());
}

#[tokio::test]
async fn unwound_transactions_are_readmission_candidates() {
    let h = harness();
    let genesis = h.index.genesis().clone();
    let b1 = testkit::mine_child(&h.params, &genesis, vec![]);
    let h1 = h.submit(&b1);
    let spend = testkit::spend(&b1.txdata[0], 0, 50 * COIN);
    let b2a = testkit::mine_child_with_time(&h.params, &h1, vec![spend.clone()], 1);
    h.submit(&b2a);
    h.sync().await;
    h.pool.on_block_applied(&b2a, 2).unwrap();

    // heavier empty branch reorganizes b2a away
    let b2b = testkit::mine_child_with_time(&h.params, &h1, vec![], 2);
    let h2b = h.submit(&b2b);
    let b3b = testkit::mine_child_with_time(&h.params, &h2b, vec![], 2);
    h.submit(&b3b);
    h.sync().await;

    let candidates = h.pool.on_block_unwound(&b2a).unwrap();
    assert_eq!(candidates, vec![spend.clone()]);
    h.pool.on_block_applied(&b2b, 2).unwrap();
    h.pool.on_block_applied(&b3b, 3).unwrap();

    // the spend is valid on the new branch too; re-admission succeeds
    let outcomes = h.pool.readmit(&candidates).unwrap();
    assert_eq!(
        outcomes,
        vec![(spend.compute_txid(), AdmitOutcome::Admitted)]
    );
    h.assert_inputs_unspent();
    assert_eq!(h.pool.chain_tip(), Some(b3b.block_hash()));
}

#[tokio::test]
async fn spend_of_reorged_away_output_no_longer_admits() {
    let h = harness();
    let genesis = h.index.genesis().clone();
    let b1a = testkit::mine_child_with_time(&h.params, &genesis, vec![], 1);
    h.submit(&b1a);
    h.sync().await;

    // reorg to a branch where b1a's coinbase never existed
    let b1b = testkit::mine_child_with_time(&h.params, &genesis, vec![], 2);
    let h1b = h.submit(&b1b);
    let b2b = testkit::mine_child_with_time(&h.params, &h1b, vec![], 2);
    h.submit(&b2b);
    h.sync().await;
    h.pool.on_block_unwound(&b1a).unwrap();
    h.pool.on_block_applied(&b1b, 1).unwrap();
    h.pool.on_block_applied(&b2b, 2).unwrap();

    // a spend of the vanished coinbase can no longer resolve its input
    let spend = testkit::spend(&b1a.txdata[0], 0, 50 * COIN);
    assert!(matches!(
        h.pool.try_add(&spend).unwrap(),
        AdmitOutcome::Rejected(RejectReason::UnknownInputs(_))
    ));
    assert!(h.pool.is_empty());
}

#[tokio::test]
async fn follower_reconciles_from_the_event_bus() {
    let h = harness();
    let events_rx = h.events.subscribe();
    let body_source: Arc<dyn consensus_core::BlockBodyProvider> = h.provider.clone();
    let follower = tokio::spawn(h.pool.clone().run_follower(events_rx, body_source));

    let genesis = h.index.genesis().clone();
    let b1 = testkit::mine_child(&h.params, &genesis, vec![]);
    let h1 = h.submit(&b1);
    h.sync().await;

    let spend = testkit::spend(&b1.txdata[0], 0, 50 * COIN);
    // wait until the follower has seen block one
    for _ in 0..100 {
        if h.pool.chain_tip() == Some(b1.block_hash()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.pool.chain_tip(), Some(b1.block_hash()));

    assert_eq!(h.pool.try_add(&spend).unwrap(), AdmitOutcome::Admitted);
    let b2 = testkit::mine_child(&h.params, &h1, vec![spend.clone()]);
    h.submit(&b2);
    h.sync().await;

    for _ in 0..100 {
        if h.pool.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.pool.is_empty(), "follower did not confirm the spend");
    assert_eq!(h.pool.chain_tip(), Some(b2.block_hash()));
    follower.abort();
}
