//! Append-only index of chained headers.
//!
//! The in-memory map is authoritative for a run and is rebuilt from the
//! header store on startup. Entries are never removed; blocks that fail
//! validation stay indexed and are excluded from target selection through the
//! invalid-block cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Target};
use parking_lot::RwLock;
use tracing::{debug, info};

use storage::{HeaderStore, StoredHeader};

use crate::chain::{Chain, ChainedHeader};
use crate::error::CoreError;
use crate::params::ChainParams;
use crate::work::ChainWork;

#[derive(Clone)]
struct IndexedHeader {
    chained: ChainedHeader,
    seq: u64,
}

pub struct ChainIndex {
    store: Arc<HeaderStore>,
    pow_limit: Target,
    genesis: ChainedHeader,
    entries: RwLock<HashMap<BlockHash, IndexedHeader>>,
    next_seq: AtomicU64,
}

impl ChainIndex {
    /// Open the index, anchoring (and persisting) the genesis header if the
    /// store is empty.
    pub fn open(store: Arc<HeaderStore>, params: &ChainParams) -> Result<Self, CoreError> {
        let pow_limit = Target::from_compact(params.pow_limit_bits);
        let genesis_header = params.genesis.header;
        let genesis = ChainedHeader::new(genesis_header, 0, ChainWork::from_bits(genesis_header.bits));

        let mut entries = HashMap::new();
        let mut next_seq = 0u64;
        for (hash, stored) in store.load_all()? {
            let chained = ChainedHeader::new(
                stored.header,
                stored.height,
                ChainWork::from_be_bytes(stored.total_work),
            );
            if chained.hash != hash {
                return Err(CoreError::Corrupt(format!(
                    "header row {hash} hashes to {}",
                    chained.hash
                )));
            }
            next_seq = next_seq.max(stored.seq + 1);
            entries.insert(
                hash,
                IndexedHeader {
                    chained,
                    seq: stored.seq,
                },
            );
        }

        if entries.is_empty() {
            store.insert(
                &genesis.hash,
                &StoredHeader {
                    header: genesis.header,
                    height: 0,
                    total_work: genesis.total_work.to_be_bytes(),
                    seq: 0,
                },
            )?;
            entries.insert(
                genesis.hash,
                IndexedHeader {
                    chained: genesis.clone(),
                    seq: 0,
                },
            );
            next_seq = 1;
            info!(hash = %genesis.hash, "anchored genesis header");
        } else if !entries.contains_key(&genesis.hash) {
            return Err(CoreError::Corrupt(
                "header store does not contain the genesis anchor".into(),
            ));
        }

        Ok(Self {
            store,
            pow_limit,
            genesis,
            entries: RwLock::new(entries),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn genesis(&self) -> &ChainedHeader {
        &self.genesis
    }

    /// Chain a header onto its indexed parent. Idempotent for headers
    /// already present. Fails with `UnknownParent` when the parent is not
    /// indexed and `InvalidWork` when the header's proof of work does not
    /// stand up to its own difficulty bits (or exceeds the pow limit).
    pub fn insert(&self, header: BlockHeader) -> Result<ChainedHeader, CoreError> {
        let hash = header.block_hash();
        if let Some(existing) = self.get(&hash) {
            return Ok(existing);
        }

        let parent = self
            .get(&header.prev_blockhash)
            .ok_or(CoreError::UnknownParent {
                hash,
                parent: header.prev_blockhash,
            })?;

        let target = header.target();
        if target > self.pow_limit {
            return Err(CoreError::InvalidWork { hash });
        }
        header
            .validate_pow(target)
            .map_err(|_| CoreError::InvalidWork { hash })?;

        let total_work = parent.total_work.add(&ChainWork::from_bits(header.bits));
        let chained = ChainedHeader::new(header, parent.height + 1, total_work);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        self.store.insert(
            &hash,
            &StoredHeader {
                header,
                height: chained.height,
                total_work: chained.total_work.to_be_bytes(),
                seq,
            },
        )?;
        self.entries.write().insert(
            hash,
            IndexedHeader {
                chained: chained.clone(),
                seq,
            },
        );
        debug!(%hash, height = chained.height, "indexed header");
        Ok(chained)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<ChainedHeader> {
        self.entries.read().get(hash).map(|e| e.chained.clone())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.read().contains_key(hash)
    }

    /// Insertion order of a header, for first-seen tie-breaking.
    pub fn insertion_seq(&self, hash: &BlockHash) -> Option<u64> {
        self.entries.read().get(hash).map(|e| e.seq)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Lazy walk from `hash` back to genesis, inclusive.
    pub fn walk_ancestors(&self, hash: &BlockHash) -> AncestorWalk<'_> {
        AncestorWalk {
            index: self,
            next: self.get(hash).map(|h| h.hash),
        }
    }

    /// Equal-height rewind to the deepest shared ancestor; None when either
    /// hash is unindexed.
    pub fn find_common_ancestor(
        &self,
        a: &BlockHash,
        b: &BlockHash,
    ) -> Result<Option<ChainedHeader>, CoreError> {
        let Some(mut left) = self.get(a) else {
            return Ok(None);
        };
        let Some(mut right) = self.get(b) else {
            return Ok(None);
        };

        let step = |header: &ChainedHeader| -> Result<ChainedHeader, CoreError> {
            self.get(&header.prev_hash())
                .ok_or_else(|| CoreError::Corrupt(format!("ancestry of {} is broken", header.hash)))
        };

        while left.height > right.height {
            left = step(&left)?;
        }
        while right.height > left.height {
            right = step(&right)?;
        }
        while left.hash != right.hash {
            if left.height == 0 {
                return Ok(None);
            }
            left = step(&left)?;
            right = step(&right)?;
        }
        Ok(Some(left))
    }

    /// Materialize the chain from genesis to `tip`.
    pub fn chain_to(&self, tip: &BlockHash) -> Result<Chain, CoreError> {
        let mut headers: Vec<ChainedHeader> = self.walk_ancestors(tip).collect();
        let bottom = headers
            .last()
            .ok_or_else(|| CoreError::Corrupt(format!("tip {tip} is not indexed")))?;
        if bottom.height != 0 || bottom.hash != self.genesis.hash {
            return Err(CoreError::Corrupt(format!(
                "ancestry of {tip} does not reach genesis"
            )));
        }
        headers.reverse();
        Chain::from_headers(headers)
    }

    /// Direct children of a header.
    pub fn children(&self, hash: &BlockHash) -> Vec<BlockHash> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.chained.prev_hash() == *hash && e.chained.height > 0)
            .map(|(child, _)| *child)
            .collect()
    }

    /// Every indexed header. The selector scans these: after an
    /// invalidation the best valid chain can end below every childless tip.
    pub fn all_headers(&self) -> Vec<ChainedHeader> {
        self.entries
            .read()
            .values()
            .map(|e| e.chained.clone())
            .collect()
    }

    /// Headers with no indexed children, i.e. the candidate tips.
    pub fn tips(&self) -> Vec<ChainedHeader> {
        let entries = self.entries.read();
        let mut parents: std::collections::HashSet<BlockHash> =
            std::collections::HashSet::with_capacity(entries.len());
        for entry in entries.values() {
            if entry.chained.height > 0 {
                parents.insert(entry.chained.prev_hash());
            }
        }
        entries
            .values()
            .filter(|e| !parents.contains(&e.chained.hash))
            .map(|e| e.chained.clone())
            .collect()
    }
}

/// Iterator over a header's ancestry, tip-down, ending at genesis.
pub struct AncestorWalk<'a> {
    index: &'a ChainIndex,
    next: Option<BlockHash>,
}

impl Iterator for AncestorWalk<'_> {
    type Item = ChainedHeader;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        let header = self.index.get(&hash)?;
        if header.height > 0 {
            self.next = Some(header.prev_hash());
        }
        Some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    fn open_index() -> (Arc<storage::Database>, Arc<ChainIndex>, ChainParams) {
        let db = Arc::new(storage::Database::open_temporary().unwrap());
        let params = testkit::test_params();
        let index = Arc::new(ChainIndex::open(db.open_header_store().unwrap(), &params).unwrap());
        (db, index, params)
    }

    #[test]
    fn insert_requires_known_parent() {
        let (_db, index, params) = open_index();
        let genesis = index.genesis().clone();
        let block = testkit::mine_child(&params, &genesis, vec![]);
        let orphan = testkit::mine_child(
            &params,
            &ChainedHeader::new(block.header, 1, ChainWork::zero()),
            vec![],
        );

        assert!(matches!(
            index.insert(orphan.header),
            Err(CoreError::UnknownParent { .. })
        ));
        index.insert(block.header).unwrap();
        // now the child's parent exists
        index.insert(orphan.header).unwrap();
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn insert_rejects_bad_pow() {
        let (_db, index, params) = open_index();
        let genesis = index.genesis().clone();
        let mut block = testkit::mine_child(&params, &genesis, vec![]);
        // break the proof of work
        loop {
            block.header.nonce = block.header.nonce.wrapping_add(1);
            if block.header.validate_pow(block.header.target()).is_err() {
                break;
            }
        }
        assert!(matches!(
            index.insert(block.header),
            Err(CoreError::InvalidWork { .. })
        ));
    }

    #[test]
    fn ancestor_walk_and_common_ancestor() {
        let (_db, index, params) = open_index();
        let genesis = index.genesis().clone();

        let mut tip_a = genesis.clone();
        for _ in 0..3 {
            let block = testkit::mine_child(&params, &tip_a, vec![]);
            tip_a = index.insert(block.header).unwrap();
        }
        // fork from height 1
        let fork_base = index.chain_to(&tip_a.hash).unwrap().at_height(1).unwrap().clone();
        let block = testkit::mine_child_with_time(&params, &fork_base, vec![], 7_777);
        let tip_b = index.insert(block.header).unwrap();

        let walked: Vec<u32> = index.walk_ancestors(&tip_a.hash).map(|h| h.height).collect();
        assert_eq!(walked, vec![3, 2, 1, 0]);

        let ancestor = index
            .find_common_ancestor(&tip_a.hash, &tip_b.hash)
            .unwrap()
            .unwrap();
        assert_eq!(ancestor.height, 1);
        assert_eq!(ancestor.hash, fork_base.hash);

        let tips = index.tips();
        assert_eq!(tips.len(), 2);
    }

    #[test]
    fn total_work_accumulates_along_chain() {
        let (_db, index, params) = open_index();
        let genesis = index.genesis().clone();
        let block = testkit::mine_child(&params, &genesis, vec![]);
        let chained = index.insert(block.header).unwrap();
        assert_eq!(
            chained.total_work,
            genesis.total_work.add(&ChainWork::from_bits(block.header.bits))
        );
        assert!(chained.total_work > genesis.total_work);
    }

    #[test]
    fn index_reloads_from_store() {
        let db = Arc::new(storage::Database::open_temporary().unwrap());
        let params = testkit::test_params();
        let store = db.open_header_store().unwrap();
        let tip = {
            let index = ChainIndex::open(store.clone(), &params).unwrap();
            let genesis = index.genesis().clone();
            let block = testkit::mine_child(&params, &genesis, vec![]);
            index.insert(block.header).unwrap()
        };
        let reopened = ChainIndex::open(store, &params).unwrap();
        assert_eq!(reopened.len(), 2);
        let reloaded = reopened.get(&tip.hash).unwrap();
        assert_eq!(reloaded.total_work, tip.total_work);
        assert_eq!(reopened.insertion_seq(&tip.hash), Some(1));
    }
}
