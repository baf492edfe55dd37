use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;

use crate::error::CoreError;
use crate::work::ChainWork;

/// A header placed on a chain: height and cumulative work from genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedHeader {
    pub header: BlockHeader,
    pub hash: BlockHash,
    pub height: u32,
    pub total_work: ChainWork,
}

impl ChainedHeader {
    pub fn new(header: BlockHeader, height: u32, total_work: ChainWork) -> Self {
        Self {
            hash: header.block_hash(),
            header,
            height,
            total_work,
        }
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_blockhash
    }
}

/// The symmetric difference between two chains sharing a genesis.
#[derive(Debug, Clone)]
pub struct ReorgPlan {
    pub common_ancestor: ChainedHeader,
    /// Blocks to unwind, deepest (current tip) first.
    pub rewind: Vec<ChainedHeader>,
    /// Blocks to apply, lowest first.
    pub advance: Vec<ChainedHeader>,
}

impl ReorgPlan {
    pub fn is_empty(&self) -> bool {
        self.rewind.is_empty() && self.advance.is_empty()
    }
}

/// An ordered header sequence from genesis to a tip. Element `h` sits at
/// height `h`; each element's `prev_blockhash` is the prior element's hash.
#[derive(Debug, Clone)]
pub struct Chain {
    headers: Vec<ChainedHeader>,
}

impl Chain {
    pub fn new(genesis: ChainedHeader) -> Self {
        debug_assert_eq!(genesis.height, 0);
        Self {
            headers: vec![genesis],
        }
    }

    /// Build from a genesis-to-tip sequence, checking linkage.
    pub fn from_headers(headers: Vec<ChainedHeader>) -> Result<Self, CoreError> {
        if headers.is_empty() {
            return Err(CoreError::Corrupt("empty chain".into()));
        }
        for (height, pair) in headers.windows(2).enumerate() {
            if pair[1].prev_hash() != pair[0].hash || pair[1].height != pair[0].height + 1 {
                return Err(CoreError::Corrupt(format!(
                    "broken chain linkage above height {height}"
                )));
            }
        }
        Ok(Self { headers })
    }

    pub fn genesis(&self) -> &ChainedHeader {
        &self.headers[0]
    }

    pub fn tip(&self) -> &ChainedHeader {
        self.headers.last().expect("chain is never empty")
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn total_work(&self) -> &ChainWork {
        &self.tip().total_work
    }

    pub fn at_height(&self, height: u32) -> Option<&ChainedHeader> {
        self.headers.get(height as usize)
    }

    pub fn contains(&self, hash: &BlockHash, height: u32) -> bool {
        self.at_height(height).is_some_and(|h| h.hash == *hash)
    }

    pub fn headers(&self) -> &[ChainedHeader] {
        &self.headers
    }

    /// Append a header extending the current tip.
    pub fn push(&mut self, header: ChainedHeader) -> Result<(), CoreError> {
        if header.prev_hash() != self.tip().hash || header.height != self.height() + 1 {
            return Err(CoreError::Corrupt(format!(
                "header {} does not extend tip {}",
                header.hash,
                self.tip().hash
            )));
        }
        self.headers.push(header);
        Ok(())
    }

    /// Drop everything above `height`.
    pub fn truncate_to(&mut self, height: u32) {
        self.headers.truncate(height as usize + 1);
    }

    /// Deepest header shared with `other`. Walks down from the lower of the
    /// two tips, so the cost is proportional to the divergence, not the
    /// chain length.
    pub fn fork_point<'a>(&'a self, other: &Chain) -> &'a ChainedHeader {
        let mut height = self.height().min(other.height());
        loop {
            let ours = &self.headers[height as usize];
            if other.contains(&ours.hash, height) {
                return ours;
            }
            debug_assert!(height > 0, "chains share a genesis");
            height -= 1;
        }
    }

    /// Rewind/advance lists taking this chain to `target`.
    pub fn reorg_plan(&self, target: &Chain) -> ReorgPlan {
        let ancestor = self.fork_point(target).clone();
        let rewind = self.headers[(ancestor.height + 1) as usize..]
            .iter()
            .rev()
            .cloned()
            .collect();
        let advance = target.headers[(ancestor.height + 1) as usize..].to_vec();
        ReorgPlan {
            common_ancestor: ancestor,
            rewind,
            advance,
        }
    }
}
