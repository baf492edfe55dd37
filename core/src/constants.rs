//! Consensus constants.

/// Maximum serialized block size, including the var-int transaction count.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum signature operations per block (legacy plus P2SH counting).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;

/// Maximum keys counted for a bare CHECKMULTISIG.
pub const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// One bitcoin, in satoshis.
pub const COIN: u64 = 100_000_000;

/// Total money supply cap: 21 million coins.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Confirmations before a coinbase output may be spent (mainnet rule).
pub const COINBASE_MATURITY: u32 = 100;

/// Block time at which P2SH (BIP16) rules, including P2SH sig-op counting,
/// take effect: 2012-04-01T00:00:00Z.
pub const BIP16_SWITCH_TIME: u32 = 1_333_238_400;

/// lock_time values below this are block heights; at or above, unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Coinbase script signature length bounds, inclusive.
pub const COINBASE_SCRIPT_SIG_MIN: usize = 2;
pub const COINBASE_SCRIPT_SIG_MAX: usize = 100;
