//! Shared helpers

pub mod random;

pub use random::RandomSource;
