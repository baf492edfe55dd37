use bitcoin::{Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};

/// A validated transaction admitted to the pool.
///
/// The resolved previous outputs are cached so re-validation after a reorg
/// does not have to touch the UTXO store for values it already knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedTx {
    pub txid: Txid,
    pub tx: Transaction,
    pub prev_outputs: Vec<TxOut>,
    pub fee: u64,
    /// Unix seconds at admission.
    pub added_at: u64,
}

impl UnconfirmedTx {
    pub fn input_value(&self) -> u64 {
        self.prev_outputs
            .iter()
            .map(|out| out.value.to_sat())
            .sum()
    }

    pub fn output_value(&self) -> u64 {
        self.tx.output.iter().map(|out| out.value.to_sat()).sum()
    }
}
