//! Invalid-block cache: durable blacklist with addition events.

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::BlockHash;
use parking_lot::RwLock;
use tracing::warn;

use storage::InvalidBlockStore;

use crate::error::CoreError;
use crate::events::{EventBus, NodeEvent};

pub struct InvalidBlockCache {
    store: Arc<InvalidBlockStore>,
    set: RwLock<HashSet<BlockHash>>,
    events: Arc<EventBus>,
}

impl InvalidBlockCache {
    pub fn open(store: Arc<InvalidBlockStore>, events: Arc<EventBus>) -> Result<Self, CoreError> {
        let set = store.load_all()?.into_iter().collect();
        Ok(Self {
            store,
            set: RwLock::new(set),
            events,
        })
    }

    /// Blacklist a block. Fires `BlockInvalidated` for first-time additions
    /// and returns whether the hash was newly added.
    pub fn add(&self, hash: &BlockHash, reason: &str) -> Result<bool, CoreError> {
        if !self.set.write().insert(*hash) {
            return Ok(false);
        }
        self.store.add(hash, reason)?;
        warn!(%hash, reason, "block marked invalid");
        self.events.publish(NodeEvent::BlockInvalidated {
            hash: *hash,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.set.read().contains(hash)
    }

    pub fn reason(&self, hash: &BlockHash) -> Result<Option<String>, CoreError> {
        Ok(self.store.reason(hash)?)
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[tokio::test]
    async fn add_is_durable_and_fires_once() {
        let db = storage::Database::open_temporary().unwrap();
        let events = Arc::new(EventBus::new());
        let cache =
            InvalidBlockCache::open(db.open_invalid_block_store().unwrap(), events.clone()).unwrap();
        let mut rx = events.subscribe();

        let hash = BlockHash::from_byte_array([5u8; 32]);
        assert!(cache.add(&hash, "bad subsidy").unwrap());
        assert!(!cache.add(&hash, "again").unwrap());
        assert!(cache.contains(&hash));
        assert_eq!(cache.reason(&hash).unwrap().as_deref(), Some("bad subsidy"));

        match rx.recv().await.unwrap() {
            NodeEvent::BlockInvalidated { hash: seen, .. } => assert_eq!(seen, hash),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        // survives a reopen through the same store
        let reopened =
            InvalidBlockCache::open(db.open_invalid_block_store().unwrap(), events).unwrap();
        assert!(reopened.contains(&hash));
    }
}
