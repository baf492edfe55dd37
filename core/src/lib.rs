//! Consensus core of the node.
//!
//! The pipeline that ingests candidate blocks, selects the heaviest valid
//! chain, applies blocks to the UTXO set under one-commit-per-block
//! semantics, and keeps downstream consumers informed through the event bus.
//!
//! ## Components
//!
//! - [`chain_index::ChainIndex`]: append-only hash to chained-header map
//! - [`target_chain::TargetChainSelector`]: heaviest-valid-work selection
//! - [`validation::BlockValidator`]: four-stage cancellable pipeline
//! - [`chain_state::ChainStateManager`]: reorganizations and UTXO commits
//! - [`invalid_cache::InvalidBlockCache`]: durable blacklist with events
//!
//! The UTXO store itself and the mempool live in sibling crates; this crate
//! drives them through the cursor contract.

pub mod cancel;
pub mod chain;
pub mod chain_index;
pub mod chain_state;
pub mod constants;
pub mod difficulty;
pub mod error;
pub mod events;
pub mod invalid_cache;
pub mod merkle;
pub mod params;
pub mod providers;
pub mod sigops;
pub mod subsidy;
pub mod target_chain;
pub mod testkit;
pub mod validation;
pub mod work;

pub use cancel::CancelToken;
pub use chain::{Chain, ChainedHeader, ReorgPlan};
pub use chain_index::ChainIndex;
pub use chain_state::ChainStateManager;
pub use error::{BlockRuleError, CoreError};
pub use events::{EventBus, NodeEvent};
pub use invalid_cache::InvalidBlockCache;
pub use params::ChainParams;
pub use providers::{BlockBodyProvider, ScriptFlags, ScriptVerifier};
pub use target_chain::TargetChainSelector;
pub use validation::{BlockContext, BlockSummary, BlockValidator, PrevOutput, ValidatableTx};
pub use work::ChainWork;
