//! Difficulty retarget schedule.
//!
//! Every `retarget_interval` blocks the target scales by the ratio of the
//! observed window timespan to the expected one, clamped to a factor of four
//! each way and bounded by the pow limit. Off-boundary blocks must repeat
//! the previous target. Regtest-style chains never retarget.

use bitcoin::{CompactTarget, Target};
use num_bigint::BigUint;

use crate::chain::Chain;
use crate::error::CoreError;
use crate::params::ChainParams;

/// The compact bits a block at `height` on `chain` must carry.
///
/// Only ancestors strictly below `height` are consulted, so the chain may or
/// may not already include the block itself.
pub fn required_bits(
    params: &ChainParams,
    chain: &Chain,
    height: u32,
) -> Result<CompactTarget, CoreError> {
    if height == 0 {
        return Ok(params.genesis.header.bits);
    }
    let prev = chain.at_height(height - 1).ok_or_else(|| {
        CoreError::Corrupt(format!("chain is missing ancestor at height {}", height - 1))
    })?;

    if params.no_pow_retargeting || height % params.retarget_interval != 0 {
        return Ok(prev.header.bits);
    }

    let window_first = chain
        .at_height(height - params.retarget_interval)
        .ok_or_else(|| {
            CoreError::Corrupt(format!(
                "chain is missing retarget ancestor at height {}",
                height - params.retarget_interval
            ))
        })?;

    let timespan = prev
        .header
        .time
        .saturating_sub(window_first.header.time)
        .clamp(params.retarget_timespan / 4, params.retarget_timespan * 4);

    let prev_target = Target::from_compact(prev.header.bits);
    let mut next = BigUint::from_bytes_be(&prev_target.to_be_bytes());
    next *= BigUint::from(timespan);
    next /= BigUint::from(params.retarget_timespan);

    let limit = BigUint::from_bytes_be(&Target::from_compact(params.pow_limit_bits).to_be_bytes());
    if next > limit {
        next = limit;
    }

    let be = next.to_bytes_be();
    let mut bytes = [0u8; 32];
    bytes[32 - be.len()..].copy_from_slice(&be);
    Ok(Target::from_be_bytes(bytes).to_compact_lossy())
}
