use bitcoin::{Block, CompactTarget, Network};

use crate::constants::COINBASE_MATURITY;

/// Chain parameters: the genesis anchor plus the schedule knobs that vary by
/// network.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network_name: &'static str,
    pub genesis: Block,
    /// Easiest permitted difficulty, in compact form.
    pub pow_limit_bits: CompactTarget,
    pub subsidy_halving_interval: u32,
    /// Blocks between difficulty retargets.
    pub retarget_interval: u32,
    /// Expected seconds per retarget window.
    pub retarget_timespan: u32,
    /// Regtest-style chains never adjust difficulty.
    pub no_pow_retargeting: bool,
    /// Height from which the coinbase must commit to the block height (BIP34).
    pub bip34_height: u32,
    pub coinbase_maturity: u32,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            network_name: "mainnet",
            genesis: bitcoin::constants::genesis_block(Network::Bitcoin),
            pow_limit_bits: CompactTarget::from_consensus(0x1d00ffff),
            subsidy_halving_interval: 210_000,
            retarget_interval: 2016,
            retarget_timespan: 14 * 24 * 60 * 60,
            no_pow_retargeting: false,
            bip34_height: 227_931,
            coinbase_maturity: COINBASE_MATURITY,
        }
    }

    pub fn regtest() -> Self {
        Self {
            network_name: "regtest",
            genesis: bitcoin::constants::genesis_block(Network::Regtest),
            pow_limit_bits: CompactTarget::from_consensus(0x207fffff),
            subsidy_halving_interval: 150,
            retarget_interval: 2016,
            retarget_timespan: 14 * 24 * 60 * 60,
            no_pow_retargeting: true,
            bip34_height: 500,
            coinbase_maturity: COINBASE_MATURITY,
        }
    }

    /// BIP34 applies from this height on.
    pub fn enforces_bip34(&self, height: u32) -> bool {
        height >= self.bip34_height
    }
}
