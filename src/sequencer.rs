//! Password-seeded block addressing.
//!
//! The first link of a chain has no stored pointer: its address is recovered by
//! replaying the same pseudo-random candidate sequence that placed it. Both
//! sides must therefore agree on the generator bit for bit, so it is pinned
//! here rather than left to a platform default.
//!
//! # Generator (version 1)
//!
//! - ChaCha20 (`rand_chacha::ChaCha20Rng`) seeded with
//!   `SeedableRng::seed_from_u64(seed)`
//! - `index = next_u64() % total_blocks`
//!
//! # Reseed policy
//!
//! The first index drawn in a session is the anchor. Whenever a later draw
//! equals the anchor, that draw is discarded, the seed advances by one, the
//! generator is re-created from the new seed and its next draw is returned.
//! The anchor itself never changes.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::warn;

/// Version of the addressing algorithm described in the module docs
pub const SEQUENCER_VERSION: u32 = 1;

/// Extract the addressing seed from a `"<seed>-<suffix>"` password
///
/// The text before the first `-` must be a decimal `u64`. A password with no
/// `-` is all seed.
#[must_use]
pub fn parse_seed(password: &str) -> Option<u64> {
    let prefix = password.split('-').next()?;
    prefix.parse().ok()
}

/// Deterministic candidate block index generator
pub struct AddressSequencer {
    rng: ChaCha20Rng,
    seed: u64,
    total_blocks: u64,
    anchor: Option<u64>,
    draws: u64,
    reseeds: u64,
}

impl AddressSequencer {
    /// Start a fresh session for `seed` over `[0, total_blocks)`
    ///
    /// A `total_blocks` of zero is treated as one.
    pub fn new(seed: u64, total_blocks: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
            total_blocks: total_blocks.max(1),
            anchor: None,
            draws: 0,
            reseeds: 0,
        }
    }

    /// Preview the first `count` candidates for `seed`
    #[must_use]
    pub fn candidates(seed: u64, total_blocks: u64, count: usize) -> Vec<u64> {
        Self::new(seed, total_blocks).take(count).collect()
    }

    /// Draw the next candidate index
    pub fn next_index(&mut self) -> u64 {
        self.draws += 1;
        let index = self.draw();

        match self.anchor {
            None => {
                self.anchor = Some(index);
                index
            }
            Some(anchor) if index == anchor => {
                self.seed = self.seed.wrapping_add(1);
                self.rng = ChaCha20Rng::seed_from_u64(self.seed);
                self.reseeds += 1;
                warn!(
                    reseeds = self.reseeds,
                    draws = self.draws,
                    "address sequence returned to its anchor, advancing seed"
                );
                self.draw()
            }
            Some(_) => index,
        }
    }

    fn draw(&mut self) -> u64 {
        self.rng.next_u64() % self.total_blocks
    }

    /// First index drawn this session, if any
    #[must_use]
    pub fn anchor(&self) -> Option<u64> {
        self.anchor
    }

    /// Number of candidates drawn so far
    #[must_use]
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Number of times the seed has advanced
    #[must_use]
    pub fn reseeds(&self) -> u64 {
        self.reseeds
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }
}

impl Iterator for AddressSequencer {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_seed() {
        assert_eq!(parse_seed("123456789-daniela"), Some(123_456_789));
        assert_eq!(parse_seed("42-with-more-dashes"), Some(42));
        assert_eq!(parse_seed("7"), Some(7));
        assert_eq!(parse_seed("7-"), Some(7));
    }

    #[test]
    fn test_parse_seed_rejects_non_numeric() {
        assert_eq!(parse_seed("daniela"), None);
        assert_eq!(parse_seed("-123"), None);
        assert_eq!(parse_seed(""), None);
        assert_eq!(parse_seed("12a-b"), None);
        assert_eq!(parse_seed("99999999999999999999999-x"), None);
    }

    #[test]
    fn test_indices_in_range() {
        let mut seq = AddressSequencer::new(123_456_789, 957_199);
        for _ in 0..10_000 {
            assert!(seq.next_index() < 957_199);
        }
        assert_eq!(seq.draws(), 10_000);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = AddressSequencer::candidates(123_456_789, 957_199, 64);
        let b = AddressSequencer::candidates(123_456_789, 957_199, 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = AddressSequencer::candidates(1, 957_199, 16);
        let b = AddressSequencer::candidates(2, 957_199, 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_anchor_is_first_draw() {
        let mut seq = AddressSequencer::new(5, 1000);
        assert_eq!(seq.anchor(), None);
        let first = seq.next_index();
        seq.next_index();
        seq.next_index();
        assert_eq!(seq.anchor(), Some(first));
    }

    #[test]
    fn test_reseed_on_single_block_device() {
        // Every draw after the first returns to the anchor
        let mut seq = AddressSequencer::new(5, 1);
        assert_eq!(seq.next_index(), 0);
        assert_eq!(seq.reseeds(), 0);
        for expected in 1..=10 {
            assert_eq!(seq.next_index(), 0);
            assert_eq!(seq.reseeds(), expected);
        }
    }

    #[test]
    fn test_reseed_points_identical() {
        let mut a = AddressSequencer::new(77, 3);
        let mut b = AddressSequencer::new(77, 3);
        for _ in 0..500 {
            assert_eq!(a.next_index(), b.next_index());
            assert_eq!(a.reseeds(), b.reseeds());
        }
        assert!(a.reseeds() > 0);
    }

    #[test]
    fn test_zero_blocks_treated_as_one() {
        let mut seq = AddressSequencer::new(1, 0);
        assert_eq!(seq.total_blocks(), 1);
        assert_eq!(seq.next_index(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn prop_sequence_deterministic(seed in any::<u64>(), total in 1_u64..2_000_000) {
            let mut a = AddressSequencer::new(seed, total);
            let mut b = AddressSequencer::new(seed, total);
            for _ in 0..256 {
                let x = a.next_index();
                prop_assert_eq!(x, b.next_index());
                prop_assert!(x < total);
            }
            prop_assert_eq!(a.reseeds(), b.reseeds());
        }
    }
}
