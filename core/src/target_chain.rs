//! Target chain selection.
//!
//! The target chain ends at the indexed header with the greatest cumulative
//! work whose entire ancestry is free of blacklisted blocks. Ties go to the
//! first-seen header. The published chain sits behind a lock and is swapped
//! atomically; the chain-state manager wakes on an auto-reset signal.

use std::sync::Arc;

use bitcoin::BlockHash;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::chain::{Chain, ChainedHeader};
use crate::chain_index::ChainIndex;
use crate::error::CoreError;
use crate::events::{EventBus, NodeEvent};
use crate::invalid_cache::InvalidBlockCache;

pub struct TargetChainSelector {
    index: Arc<ChainIndex>,
    invalid: Arc<InvalidBlockCache>,
    events: Arc<EventBus>,
    target: RwLock<Arc<Chain>>,
    changed: Arc<Notify>,
}

impl TargetChainSelector {
    pub fn open(
        index: Arc<ChainIndex>,
        invalid: Arc<InvalidBlockCache>,
        events: Arc<EventBus>,
    ) -> Result<Self, CoreError> {
        let genesis_chain = Chain::new(index.genesis().clone());
        let selector = Self {
            index,
            invalid,
            events,
            target: RwLock::new(Arc::new(genesis_chain)),
            changed: Arc::new(Notify::new()),
        };
        selector.rescan()?;
        Ok(selector)
    }

    /// The current target chain.
    pub fn target_chain(&self) -> Arc<Chain> {
        self.target.read().clone()
    }

    /// Auto-reset signal fired whenever the target chain changes.
    pub fn change_signal(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// Index a freshly received header and reconsider the target.
    pub fn submit_header(
        &self,
        header: bitcoin::block::Header,
    ) -> Result<ChainedHeader, CoreError> {
        let chained = self.index.insert(header)?;
        self.consider(&chained)?;
        Ok(chained)
    }

    /// Incremental recompute for one candidate tip: only a strictly heavier
    /// tip can displace the current target.
    pub fn consider(&self, candidate: &ChainedHeader) -> Result<(), CoreError> {
        let current = self.target_chain();
        if candidate.hash == current.tip().hash
            || candidate.total_work <= *current.total_work()
        {
            return Ok(());
        }
        self.rescan().map(|_| ())
    }

    /// Full re-selection over the indexed headers. Blacklisted ancestry
    /// disqualifies a candidate and transitively blacklists everything
    /// descended from the offending header.
    pub fn rescan(&self) -> Result<bool, CoreError> {
        let mut tips = self.index.all_headers();
        tips.sort_by(|a, b| {
            b.total_work.cmp(&a.total_work).then_with(|| {
                let seq_a = self.index.insertion_seq(&a.hash).unwrap_or(u64::MAX);
                let seq_b = self.index.insertion_seq(&b.hash).unwrap_or(u64::MAX);
                seq_a.cmp(&seq_b)
            })
        });

        for tip in tips {
            if let Some(bad) = self.first_blacklisted_ancestor(&tip.hash) {
                debug!(tip = %tip.hash, invalid = %bad, "skipping candidate with blacklisted ancestry");
                self.mark_descendants(&bad)?;
                continue;
            }
            return self.adopt(&tip);
        }
        Err(CoreError::Corrupt("no valid chain tip available".into()))
    }

    /// Listen for invalid-block additions and reschedule a rescan, the
    /// subscription half of the cache/selector cycle.
    pub fn spawn_invalidation_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let selector = Arc::clone(self);
        let mut rx = selector.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(NodeEvent::BlockInvalidated { .. }) => {
                        if let Err(e) = selector.rescan() {
                            error!(error = %e, "target rescan failed");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if selector.rescan().is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    fn adopt(&self, tip: &ChainedHeader) -> Result<bool, CoreError> {
        {
            let current = self.target.read();
            if current.tip().hash == tip.hash {
                return Ok(false);
            }
        }
        let chain = self.index.chain_to(&tip.hash)?;
        *self.target.write() = Arc::new(chain);
        info!(tip = %tip.hash, height = tip.height, work = %tip.total_work, "target chain changed");
        self.changed.notify_one();
        self.events.publish(NodeEvent::TargetChainChanged {
            tip: tip.hash,
            height: tip.height,
        });
        Ok(true)
    }

    /// Highest blacklisted header on the ancestry of `tip`, if any.
    fn first_blacklisted_ancestor(&self, tip: &BlockHash) -> Option<BlockHash> {
        self.index
            .walk_ancestors(tip)
            .find(|header| self.invalid.contains(&header.hash))
            .map(|header| header.hash)
    }

    fn mark_descendants(&self, root: &BlockHash) -> Result<(), CoreError> {
        let mut queue = self.index.children(root);
        while let Some(hash) = queue.pop() {
            self.invalid
                .add(&hash, &format!("descends from invalid block {root}"))?;
            queue.extend(self.index.children(&hash));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    struct Fixture {
        _db: Arc<storage::Database>,
        index: Arc<ChainIndex>,
        invalid: Arc<InvalidBlockCache>,
        selector: Arc<TargetChainSelector>,
        params: crate::params::ChainParams,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(storage::Database::open_temporary().unwrap());
        let params = testkit::test_params();
        let events = Arc::new(EventBus::new());
        let index = Arc::new(ChainIndex::open(db.open_header_store().unwrap(), &params).unwrap());
        let invalid = Arc::new(
            InvalidBlockCache::open(db.open_invalid_block_store().unwrap(), events.clone())
                .unwrap(),
        );
        let selector = Arc::new(
            TargetChainSelector::open(index.clone(), invalid.clone(), events).unwrap(),
        );
        Fixture {
            _db: db,
            index,
            invalid,
            selector,
            params,
        }
    }

    fn extend(fx: &Fixture, parent: &ChainedHeader, time_salt: u32) -> ChainedHeader {
        let block = testkit::mine_child_with_time(&fx.params, parent, vec![], time_salt);
        fx.selector.submit_header(block.header).unwrap()
    }

    #[test]
    fn heavier_tip_wins_and_ties_stay_first_seen() {
        let fx = fixture();
        let genesis = fx.index.genesis().clone();

        let b1 = extend(&fx, &genesis, 1);
        let b2 = extend(&fx, &b1, 2);
        assert_eq!(fx.selector.target_chain().tip().hash, b2.hash);

        // equal-work sibling of b2: first-seen b2 keeps the target
        let b2b = extend(&fx, &b1, 99);
        assert_ne!(b2b.hash, b2.hash);
        assert_eq!(fx.selector.target_chain().tip().hash, b2.hash);

        // extending the sibling makes it strictly heavier
        let b3b = extend(&fx, &b2b, 100);
        assert_eq!(fx.selector.target_chain().tip().hash, b3b.hash);
        assert_eq!(fx.selector.target_chain().height(), 3);
    }

    #[test]
    fn invalidation_moves_target_and_marks_descendants() {
        let fx = fixture();
        let genesis = fx.index.genesis().clone();

        let b1 = extend(&fx, &genesis, 1);
        let b2 = extend(&fx, &b1, 2);
        let b3 = extend(&fx, &b2, 3);
        assert_eq!(fx.selector.target_chain().tip().hash, b3.hash);

        // a lighter but valid sibling of b2
        let b2b = extend(&fx, &b1, 50);

        fx.invalid.add(&b2.hash, "failed validation").unwrap();
        fx.selector.rescan().unwrap();

        assert_eq!(fx.selector.target_chain().tip().hash, b2b.hash);
        // b3 descends from b2 and is now transitively blacklisted
        assert!(fx.invalid.contains(&b3.hash));
    }

    #[tokio::test]
    async fn change_signal_fires_on_adoption() {
        let fx = fixture();
        let genesis = fx.index.genesis().clone();
        let signal = fx.selector.change_signal();

        extend(&fx, &genesis, 1);
        // the permit was stored by the adoption above
        signal.notified().await;
    }
}
