//! Default hashing configuration.
//!
//! Tables stored in a relocatable region must hash identically across
//! process runs, so the default build-hasher is deterministic (fixed
//! seed) rather than randomly seeded per process. Callers who want
//! DoS-resistant randomized hashing can supply
//! `std::collections::hash_map::RandomState` or any other
//! `BuildHasher` instead.

/// Deterministic default hasher for all containers in this crate.
pub type DefaultHashBuilder = foldhash::fast::FixedState;

/// A `DefaultHashBuilder` with an explicit seed, for reproducible
/// layouts and for keeping independent tables decorrelated.
pub fn seeded_hash_builder(seed: u64) -> DefaultHashBuilder {
    DefaultHashBuilder::with_seed(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::BuildHasher;

    /// Invariant: the default hasher is deterministic: two independently
    /// constructed instances agree on every hash.
    #[test]
    fn default_is_deterministic() {
        let a = DefaultHashBuilder::default();
        let b = DefaultHashBuilder::default();
        for k in [0u64, 1, 7, u64::MAX] {
            assert_eq!(a.hash_one(k), b.hash_one(k));
        }
        assert_eq!(a.hash_one("a string key"), b.hash_one("a string key"));
    }

    /// Invariant: different seeds produce different hash streams (for at
    /// least one probe key), same seeds produce identical ones.
    #[test]
    fn seeds_decorrelate() {
        let a = seeded_hash_builder(1);
        let b = seeded_hash_builder(2);
        let c = seeded_hash_builder(1);
        assert_eq!(a.hash_one(123u64), c.hash_one(123u64));
        assert!((0u64..64).any(|k| a.hash_one(k) != b.hash_one(k)));
    }
}
