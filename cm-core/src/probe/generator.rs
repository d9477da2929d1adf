//! Fresh fingerprint values for unseen devices

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{validate_probe_count, Fingerprint};
use crate::error::Result;

/// Picks ⌊N/2⌋ distinct probe positions uniformly at random
///
/// Values are not checked against the signature index, so two devices can
/// draw the same value (roughly 1 in C(N, N/2)).
pub struct FingerprintGenerator {
    probe_count: usize,
    rng: Mutex<StdRng>,
}

impl FingerprintGenerator {
    /// Generator seeded from OS entropy
    pub fn new(probe_count: usize) -> Result<Self> {
        validate_probe_count(probe_count)?;
        Ok(Self {
            probe_count,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Deterministic generator
    pub fn with_seed(probe_count: usize, seed: u64) -> Result<Self> {
        validate_probe_count(probe_count)?;
        Ok(Self {
            probe_count,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count
    }

    /// Number of bits every generated value has set
    pub fn marked_bits(&self) -> usize {
        self.probe_count / 2
    }

    pub fn generate(&self) -> Fingerprint {
        let mut rng = self.rng.lock();
        let picked = rand::seq::index::sample(&mut *rng, self.probe_count, self.marked_bits());
        Fingerprint::from_positions(picked.into_iter())
    }

    /// Shuffle items with the generator's RNG
    pub fn shuffle<T>(&self, items: &mut [T]) {
        use rand::seq::SliceRandom;
        items.shuffle(&mut *self.rng.lock());
    }
}
