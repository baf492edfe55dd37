//! Seams to the collaborators the core consumes.

use async_trait::async_trait;
use bitcoin::{Block, BlockHash, Script, Transaction};

use crate::error::CoreError;

/// Flags steering script verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptFlags {
    /// Enforce P2SH evaluation (BIP16).
    pub verify_p2sh: bool,
}

/// External script interpreter. The core consumes only the verdict.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_pubkey: &Script,
        tx: &Transaction,
        input_index: usize,
        script_sig: &Script,
        flags: ScriptFlags,
    ) -> bool;
}

/// Source of block bodies. `Ok(None)` means not yet available; the reorg is
/// deferred and retried when the body arrives.
#[async_trait]
pub trait BlockBodyProvider: Send + Sync {
    async fn fetch(&self, hash: &BlockHash) -> Result<Option<Block>, CoreError>;
}
