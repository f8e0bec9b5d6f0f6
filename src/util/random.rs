//! Random test data
//!
//! Generator for owners, amounts and currencies used by tests and by the
//! `seed` command. Each source is constructed explicitly; pass a seed to
//! reproduce a run.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core_types::MinorUnits;
use crate::ledger::Currency;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub struct RandomSource {
    rng: StdRng,
}

impl RandomSource {
    /// Deterministic source
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Integer in `min..=max`
    ///
    /// # Panics
    ///
    /// If `min > max`. Callers pass fixed bounds.
    pub fn random_int(&mut self, min: i64, max: i64) -> i64 {
        self.rng.gen_range(min..=max)
    }

    /// Lowercase ASCII string of length `n`
    pub fn random_string(&mut self, n: usize) -> String {
        (0..n)
            .map(|_| char::from(ALPHABET[self.rng.gen_range(0..ALPHABET.len())]))
            .collect()
    }

    pub fn random_owner(&mut self) -> String {
        self.random_string(6)
    }

    pub fn random_money(&mut self) -> MinorUnits {
        self.random_int(0, 1000)
    }

    pub fn random_currency(&mut self) -> Currency {
        Currency::ALL[self.rng.gen_range(0..Currency::ALL.len())]
    }
}
