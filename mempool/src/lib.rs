//! Unconfirmed-transaction pool.
//!
//! The pool admits transactions whose inputs are confirmed and unspent,
//! indexes them by the outputs they spend, and reconciles itself atomically
//! with every block the chain state applies or unwinds.

pub mod entry;
pub mod error;
pub mod pool;

pub use entry::UnconfirmedTx;
pub use error::MempoolError;
pub use pool::{AdmitOutcome, Mempool, RejectReason};
