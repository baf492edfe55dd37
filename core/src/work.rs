use std::cmp::Ordering;
use std::fmt;

use bitcoin::{CompactTarget, Target};
use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Cumulative proof-of-work as an unbounded unsigned integer.
///
/// Per-header work is 2^256 / (target + 1); chain work is the sum from
/// genesis. Persisted as 32 big-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWork {
    value: BigUint,
}

impl ChainWork {
    pub fn zero() -> Self {
        Self {
            value: BigUint::zero(),
        }
    }

    /// Work contributed by a header with the given target.
    pub fn from_target(target: Target) -> Self {
        let target_value = BigUint::from_bytes_be(&target.to_be_bytes());
        let two_256: BigUint = BigUint::one() << 256u32;
        Self {
            value: two_256 / (target_value + BigUint::one()),
        }
    }

    /// Work contributed by a header with the given compact difficulty bits.
    pub fn from_bits(bits: CompactTarget) -> Self {
        Self::from_target(Target::from_compact(bits))
    }

    pub fn add(&self, other: &ChainWork) -> ChainWork {
        Self {
            value: &self.value + &other.value,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let bytes = self.value.to_bytes_be();
        let mut out = [0u8; 32];
        let start = 32usize.saturating_sub(bytes.len());
        out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
        out
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self {
            value: BigUint::from_bytes_be(&bytes),
        }
    }

    /// Bit length of the work value; diagnostics only.
    pub fn log2(&self) -> u64 {
        self.value.bits()
    }
}

impl Default for ChainWork {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialOrd for ChainWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChainWork {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:064x}", self.value)
    }
}
