use bitcoin::{Transaction, TxOut, Txid};

/// A resolved previous output: the payload plus what contextual validation
/// needs to know about its origin.
#[derive(Debug, Clone)]
pub struct PrevOutput {
    pub output: TxOut,
    /// Height of the block that created the output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
}

/// One transaction as fed to the validator: its position in the block, the
/// canonical bytes, and its inputs' resolved previous outputs (empty for the
/// coinbase).
#[derive(Debug, Clone)]
pub struct ValidatableTx {
    pub index: usize,
    pub txid: Txid,
    pub tx: Transaction,
    pub tx_bytes: Vec<u8>,
    pub prev_outputs: Vec<PrevOutput>,
}

impl ValidatableTx {
    pub fn new(index: usize, tx: Transaction, prev_outputs: Vec<PrevOutput>) -> Self {
        let txid = tx.compute_txid();
        let tx_bytes = bitcoin::consensus::encode::serialize(&tx);
        Self {
            index,
            txid,
            tx,
            tx_bytes,
            prev_outputs,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.index == 0
    }

    /// Sum of resolved input values; u128 so callers control overflow policy.
    pub fn input_value(&self) -> u128 {
        self.prev_outputs
            .iter()
            .map(|prev| prev.output.value.to_sat() as u128)
            .sum()
    }

    /// Sum of output values.
    pub fn output_value(&self) -> u128 {
        self.tx
            .output
            .iter()
            .map(|out| out.value.to_sat() as u128)
            .sum()
    }
}
