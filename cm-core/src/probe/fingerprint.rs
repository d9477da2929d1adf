//! Fingerprint value: one bit per probe

use serde::{Deserialize, Serialize};
use std::fmt;

/// N-bit cache-residency value; bit i set iff probe i was a HIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// The value of a device that has none of the probes cached
    pub const UNSEEN: Fingerprint = Fingerprint(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Build a value from a set of probe positions
    pub fn from_positions<I: IntoIterator<Item = usize>>(positions: I) -> Self {
        let mut bits = 0u64;
        for i in positions {
            debug_assert!(i < 64, "probe position out of range");
            bits |= 1u64 << i;
        }
        Self(bits)
    }

    pub fn is_unseen(self) -> bool {
        self.0 == 0
    }

    pub fn is_set(self, position: usize) -> bool {
        position < 64 && self.0 & (1u64 << position) != 0
    }

    pub fn count_ones(self) -> u32 {
        self.0.count_ones()
    }

    /// Positions of the set bits, lowest first
    pub fn positions(self) -> impl Iterator<Item = usize> {
        (0..64).filter(move |&i| self.0 & (1u64 << i) != 0)
    }

    /// Whether the value is representable with `probe_count` probes
    pub fn fits(self, probe_count: usize) -> bool {
        probe_count >= 64 || self.0 >> probe_count == 0
    }

    /// Largest value for `probe_count` probes (all HIT)
    pub fn all_hit(probe_count: usize) -> Self {
        if probe_count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << probe_count) - 1)
        }
    }

    /// Bit string with probe 0 on the right, padded to `probe_count` digits
    pub fn to_bit_string(self, probe_count: usize) -> String {
        format!("{:0width$b}", self.0, width = probe_count)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Fingerprint {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}
