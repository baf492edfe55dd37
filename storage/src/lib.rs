//! Persistent stores backing the consensus core.
//!
//! Everything lives in a single [`sled`] database. The chain state (UTXO set,
//! undo data, chain tip) occupies one tree with record-type key prefixes so a
//! block's worth of changes commits as a single atomic batch; headers, the
//! invalid-block set, and the mempool have their own trees.
//!
//! Mutation goes through cursors ([`ChainStateCursor`], [`MempoolCursor`]) that
//! stage writes in memory and apply them on `commit`. A cursor dropped without
//! committing rolls back by construction.

pub mod chain_state;
pub mod database;
pub mod error;
pub mod header_store;
pub mod invalid_store;
pub mod mempool_store;
pub mod undo;

pub use chain_state::{
    ChainStateCursor, ChainStateStats, ChainStateStore, OutputState, OutputStates, UnspentTx,
};
pub use database::Database;
pub use error::StorageError;
pub use header_store::{HeaderStore, StoredHeader};
pub use invalid_store::InvalidBlockStore;
pub use mempool_store::{MempoolCursor, MempoolStore};
pub use undo::{BlockUndoData, SpentOutputUndo};
