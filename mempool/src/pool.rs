//! The unconfirmed-transaction pool.
//!
//! Consistency model: a coarse update lock serializes block apply/unwind
//! against admission (admission demotes to a shared guard when the backend
//! tolerates concurrent mempool writers), and a narrower commit lock covers
//! the instant where the durable chain tip and the in-memory tip pointer
//! swap together, so readers never observe a tip that disagrees with the
//! persisted state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::{Block, BlockHash, OutPoint, Transaction, TxOut, Txid};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace, warn};

use consensus_core::constants::MAX_MONEY;
use consensus_core::events::{EventBus, NodeEvent};
use storage::{ChainStateStore, MempoolCursor, MempoolStore, OutputState};

use crate::entry::UnconfirmedTx;
use crate::error::MempoolError;

/// Why an admission was declined. A verdict, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    AlreadyPresent,
    /// An input does not resolve to a confirmed unspent output.
    UnknownInputs(OutPoint),
    /// The same output is named twice within the transaction.
    DuplicateInput(OutPoint),
    OutputsExceedInputs,
    FeeOutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    Rejected(RejectReason),
}

enum UpdateGuard<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

pub struct Mempool {
    chain_state: Arc<ChainStateStore>,
    store: Arc<MempoolStore>,
    events: Arc<EventBus>,
    entries: DashMap<Txid, Arc<UnconfirmedTx>>,
    /// Which pool transactions spend which confirmed output.
    spends: DashMap<OutPoint, HashSet<Txid>>,
    update_lock: RwLock<()>,
    commit_lock: Mutex<()>,
    chain_tip: RwLock<Option<BlockHash>>,
    concurrent_writers: bool,
}

impl Mempool {
    /// Open the pool, recovering persisted entries and the mempool's view of
    /// the chain tip.
    pub fn open(
        chain_state: Arc<ChainStateStore>,
        store: Arc<MempoolStore>,
        events: Arc<EventBus>,
        concurrent_writers: bool,
    ) -> Result<Self, MempoolError> {
        let entries = DashMap::new();
        let spends: DashMap<OutPoint, HashSet<Txid>> = DashMap::new();
        for (txid, bytes) in store.load_all()? {
            let entry: UnconfirmedTx =
                bincode::deserialize(&bytes).map_err(storage::StorageError::from)?;
            for input in &entry.tx.input {
                spends
                    .entry(input.previous_output)
                    .or_default()
                    .insert(txid);
            }
            entries.insert(txid, Arc::new(entry));
        }
        let chain_tip = store.chain_tip()?;
        if !entries.is_empty() {
            info!(count = entries.len(), "recovered mempool entries");
        }
        Ok(Self {
            chain_state,
            store,
            events,
            entries,
            spends,
            update_lock: RwLock::new(()),
            commit_lock: Mutex::new(()),
            chain_tip: RwLock::new(chain_tip),
            concurrent_writers,
        })
    }

    fn update_guard(&self) -> UpdateGuard<'_> {
        if self.concurrent_writers {
            UpdateGuard::Shared(self.update_lock.read())
        } else {
            UpdateGuard::Exclusive(self.update_lock.write())
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<Arc<UnconfirmedTx>> {
        self.entries.get(txid).map(|entry| entry.clone())
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// The chain tip this pool was last reconciled against.
    pub fn chain_tip(&self) -> Option<BlockHash> {
        *self.chain_tip.read()
    }

    /// Pool transactions spending `outpoint`.
    pub fn get_spending(&self, outpoint: &OutPoint) -> HashSet<Txid> {
        self.spends
            .get(outpoint)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Validate and admit one transaction. Admission failures are verdicts;
    /// only storage trouble is an error.
    pub fn try_add(&self, tx: &Transaction) -> Result<AdmitOutcome, MempoolError> {
        let _update = self.update_guard();
        let txid = tx.compute_txid();

        if self.entries.contains_key(&txid) {
            return Ok(AdmitOutcome::Rejected(RejectReason::AlreadyPresent));
        }

        let mut seen = HashSet::with_capacity(tx.input.len());
        for input in &tx.input {
            if !seen.insert(input.previous_output) {
                return Ok(AdmitOutcome::Rejected(RejectReason::DuplicateInput(
                    input.previous_output,
                )));
            }
        }

        // resolve against the committed UTXO snapshot
        let cursor = self.chain_state.begin(true);
        let mut prev_outputs: Vec<TxOut> = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let outpoint = input.previous_output;
            let resolved = cursor
                .try_get_unspent_tx(&outpoint.txid)
                .map_err(MempoolError::from)?
                .filter(|unspent| {
                    outpoint.vout < unspent.output_count()
                        && unspent.output_states.state(outpoint.vout) == OutputState::Unspent
                });
            if resolved.is_none() {
                return Ok(AdmitOutcome::Rejected(RejectReason::UnknownInputs(outpoint)));
            }
            match cursor.try_get_unspent_output(&outpoint)? {
                Some(output) => prev_outputs.push(output),
                None => {
                    return Ok(AdmitOutcome::Rejected(RejectReason::UnknownInputs(outpoint)))
                }
            }
        }
        drop(cursor);

        let input_value: u64 = prev_outputs.iter().map(|out| out.value.to_sat()).sum();
        let output_value: u64 = tx.output.iter().map(|out| out.value.to_sat()).sum();
        if input_value < output_value {
            return Ok(AdmitOutcome::Rejected(RejectReason::OutputsExceedInputs));
        }
        let fee = input_value - output_value;
        if fee > MAX_MONEY {
            return Ok(AdmitOutcome::Rejected(RejectReason::FeeOutOfRange));
        }

        let entry = Arc::new(UnconfirmedTx {
            txid,
            tx: tx.clone(),
            prev_outputs,
            fee,
            added_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
        });

        let mut cursor = self.store.begin(false);
        cursor.put_tx(
            &txid,
            bincode::serialize(entry.as_ref()).map_err(storage::StorageError::from)?,
        )?;
        for input in &tx.input {
            cursor.add_spend(&input.previous_output, &txid)?;
        }
        cursor.commit()?;

        for input in &tx.input {
            self.spends
                .entry(input.previous_output)
                .or_default()
                .insert(txid);
        }
        self.entries.insert(txid, entry);

        debug!(%txid, fee, "transaction admitted to mempool");
        self.events.publish(NodeEvent::TxAdded { txid });
        Ok(AdmitOutcome::Admitted)
    }

    fn evict(
        &self,
        txid: &Txid,
        cursor: &mut MempoolCursor<'_>,
    ) -> Result<Option<Arc<UnconfirmedTx>>, MempoolError> {
        let Some((_, entry)) = self.entries.remove(txid) else {
            return Ok(None);
        };
        cursor.delete_tx(txid)?;
        for input in &entry.tx.input {
            cursor.delete_spend(&input.previous_output, txid)?;
            if let Some(mut set) = self.spends.get_mut(&input.previous_output) {
                set.remove(txid);
            }
            self.spends
                .remove_if(&input.previous_output, |_, set| set.is_empty());
        }
        Ok(Some(entry))
    }

    /// Reconcile with a newly applied block: drop its confirmed
    /// transactions, evict entries whose inputs the block consumed on-chain,
    /// and move the durable tip forward.
    pub fn on_block_applied(
        &self,
        block: &Block,
        height: u32,
    ) -> Result<(Vec<Txid>, Vec<Txid>), MempoolError> {
        let _update = self.update_lock.write();
        let hash = block.block_hash();
        let mut cursor = self.store.begin(false);

        let mut confirmed = Vec::new();
        let mut conflicts = Vec::new();
        for tx in &block.txdata {
            let txid = tx.compute_txid();
            if self.evict(&txid, &mut cursor)?.is_some() {
                confirmed.push(txid);
            }
            for input in &tx.input {
                if input.previous_output.is_null() {
                    continue;
                }
                for spender in self.get_spending(&input.previous_output) {
                    if spender != txid && self.evict(&spender, &mut cursor)?.is_some() {
                        trace!(txid = %spender, spent = %input.previous_output, "evicting conflicting mempool tx");
                        conflicts.push(spender);
                    }
                }
            }
        }
        cursor.set_chain_tip(&hash)?;

        {
            let _commit = self.commit_lock.lock();
            cursor.commit()?;
            *self.chain_tip.write() = Some(hash);
        }

        info!(
            block = %hash,
            height,
            confirmed = confirmed.len(),
            conflicts = conflicts.len(),
            "mempool reconciled with applied block"
        );
        self.events.publish(NodeEvent::TxesConfirmed {
            block: hash,
            txids: confirmed.clone(),
        });
        Ok((confirmed, conflicts))
    }

    /// Reconcile with an unwound block. The block's non-coinbase
    /// transactions are returned as re-admission candidates; attempting
    /// re-admission (via [`readmit`](Self::readmit)) is the subscriber's
    /// call.
    pub fn on_block_unwound(&self, block: &Block) -> Result<Vec<Transaction>, MempoolError> {
        let _update = self.update_lock.write();
        let hash = block.block_hash();
        let prev = block.header.prev_blockhash;

        let mut cursor = self.store.begin(false);
        cursor.set_chain_tip(&prev)?;
        {
            let _commit = self.commit_lock.lock();
            cursor.commit()?;
            *self.chain_tip.write() = Some(prev);
        }

        let candidates: Vec<Transaction> = block.txdata.iter().skip(1).cloned().collect();
        info!(
            block = %hash,
            candidates = candidates.len(),
            "mempool reconciled with unwound block"
        );
        self.events.publish(NodeEvent::TxesUnconfirmed {
            block: hash,
            txids: candidates.iter().map(|tx| tx.compute_txid()).collect(),
        });
        Ok(candidates)
    }

    /// Try to re-admit unwound transactions, in order.
    pub fn readmit(
        &self,
        candidates: &[Transaction],
    ) -> Result<Vec<(Txid, AdmitOutcome)>, MempoolError> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for tx in candidates {
            let outcome = self.try_add(tx)?;
            outcomes.push((tx.compute_txid(), outcome));
        }
        Ok(outcomes)
    }

    /// Follow the node event bus, reconciling on every applied or unwound
    /// block and attempting re-admission of unwound transactions. Runs until
    /// the bus closes.
    pub async fn run_follower(
        self: Arc<Self>,
        mut events_rx: tokio::sync::broadcast::Receiver<NodeEvent>,
        provider: Arc<dyn consensus_core::BlockBodyProvider>,
    ) -> Result<(), MempoolError> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events_rx.recv().await {
                Ok(NodeEvent::BlockApplied { hash, height, .. }) => {
                    match provider.fetch(&hash).await {
                        Ok(Some(block)) => {
                            self.on_block_applied(&block, height)?;
                        }
                        Ok(None) | Err(_) => {
                            warn!(%hash, "applied block body unavailable to mempool follower");
                        }
                    }
                }
                Ok(NodeEvent::BlockUnwound { hash, .. }) => match provider.fetch(&hash).await {
                    Ok(Some(block)) => {
                        let candidates = self.on_block_unwound(&block)?;
                        self.readmit(&candidates)?;
                    }
                    Ok(None) | Err(_) => {
                        warn!(%hash, "unwound block body unavailable to mempool follower");
                    }
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "mempool follower lagged behind the event bus");
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_core::testkit;

    struct Fixture {
        _db: storage::Database,
        chain_state: Arc<ChainStateStore>,
        pool: Mempool,
    }

    fn fixture() -> Fixture {
        let db = storage::Database::open_temporary().unwrap();
        let chain_state = db.open_chain_state().unwrap();
        let pool = Mempool::open(
            chain_state.clone(),
            db.open_mempool_store().unwrap(),
            Arc::new(EventBus::new()),
            db.supports_concurrent_writers(),
        )
        .unwrap();
        Fixture {
            _db: db,
            chain_state,
            pool,
        }
    }

    /// Confirm a funding transaction straight into the UTXO set.
    fn confirm(fx: &Fixture, tx: &Transaction, height: u32, index: u32) {
        let mut cursor = fx.chain_state.begin(false);
        cursor
            .try_add_unspent_tx(&tx.compute_txid(), height, index, &tx.output)
            .unwrap();
        cursor.commit().unwrap();
    }

    fn funding_tx(value: u64) -> Transaction {
        // an already-confirmed anyone-can-spend source
        let params = testkit::test_params();
        let genesis = testkit::genesis_header(&params);
        testkit::mine_child(&params, &genesis, vec![])
            .txdata
            .first()
            .map(|coinbase| {
                let mut tx = coinbase.clone();
                tx.output[0].value = bitcoin::Amount::from_sat(value);
                tx
            })
            .unwrap()
    }

    #[test]
    fn admits_spend_of_confirmed_output() {
        let fx = fixture();
        let funding = funding_tx(10_000);
        confirm(&fx, &funding, 1, 1);

        let spend = testkit::spend(&funding, 0, 9_000);
        assert_eq!(fx.pool.try_add(&spend).unwrap(), AdmitOutcome::Admitted);
        let txid = spend.compute_txid();
        assert!(fx.pool.contains(&txid));
        assert_eq!(fx.pool.get(&txid).unwrap().fee, 1_000);
        assert_eq!(
            fx.pool.get_spending(&spend.input[0].previous_output),
            HashSet::from([txid])
        );

        // double admission is a verdict, not an error
        assert_eq!(
            fx.pool.try_add(&spend).unwrap(),
            AdmitOutcome::Rejected(RejectReason::AlreadyPresent)
        );
    }

    #[test]
    fn rejects_unknown_and_overdrawn_inputs() {
        let fx = fixture();
        let funding = funding_tx(10_000);

        let orphan = testkit::spend(&funding, 0, 1_000);
        assert!(matches!(
            fx.pool.try_add(&orphan).unwrap(),
            AdmitOutcome::Rejected(RejectReason::UnknownInputs(_))
        ));

        confirm(&fx, &funding, 1, 1);
        let overdrawn = testkit::spend(&funding, 0, 20_000);
        assert_eq!(
            fx.pool.try_add(&overdrawn).unwrap(),
            AdmitOutcome::Rejected(RejectReason::OutputsExceedInputs)
        );
    }

    #[test]
    fn rejects_intra_tx_double_spend() {
        let fx = fixture();
        let funding = funding_tx(10_000);
        confirm(&fx, &funding, 1, 1);

        let mut doubled = testkit::spend(&funding, 0, 1_000);
        let duplicate = doubled.input[0].clone();
        doubled.input.push(duplicate);
        assert!(matches!(
            fx.pool.try_add(&doubled).unwrap(),
            AdmitOutcome::Rejected(RejectReason::DuplicateInput(_))
        ));
    }

    #[test]
    fn pool_recovers_from_store() {
        let db = storage::Database::open_temporary().unwrap();
        let chain_state = db.open_chain_state().unwrap();
        let store = db.open_mempool_store().unwrap();
        let events = Arc::new(EventBus::new());

        let funding = funding_tx(5_000);
        let spend = testkit::spend(&funding, 0, 4_000);
        {
            let pool =
                Mempool::open(chain_state.clone(), store.clone(), events.clone(), true).unwrap();
            let mut cursor = chain_state.begin(false);
            cursor
                .try_add_unspent_tx(&funding.compute_txid(), 1, 1, &funding.output)
                .unwrap();
            cursor.commit().unwrap();
            assert_eq!(pool.try_add(&spend).unwrap(), AdmitOutcome::Admitted);
        }

        let recovered = Mempool::open(chain_state, store, events, true).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered.contains(&spend.compute_txid()));
        assert_eq!(
            recovered.get_spending(&spend.input[0].previous_output),
            HashSet::from([spend.compute_txid()])
        );
    }
}
