//! Node event bus.
//!
//! Components publish into a broadcast channel and subscribers hold only a
//! receiver, so daemons and caches can observe each other without
//! back-references. Publishing never blocks; a subscriber that falls behind
//! sees a `Lagged` gap, which every consumer here treats as "rescan".

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Txid};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The selector published a new target chain.
    TargetChainChanged { tip: BlockHash, height: u32 },
    /// The live chain tip moved.
    ChainTipAdvanced { tip: BlockHash, height: u32 },
    BlockApplied {
        hash: BlockHash,
        height: u32,
        header: BlockHeader,
    },
    BlockUnwound {
        hash: BlockHash,
        height: u32,
        header: BlockHeader,
    },
    BlockInvalidated {
        hash: BlockHash,
        reason: String,
    },
    TxAdded {
        txid: Txid,
    },
    TxesConfirmed {
        block: BlockHash,
        txids: Vec<Txid>,
    },
    TxesUnconfirmed {
        block: BlockHash,
        txids: Vec<Txid>,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; silently a no-op when nobody is subscribed.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
