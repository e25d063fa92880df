//! Seeded random source shared by one simulation context.

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Deterministic uniform sampler. Given the same seed and the same call
/// sequence, results are bit-identical within one build of the crate.
///
/// One instance per context; the stress schedule carries its own so that
/// enabling stress noise does not perturb the main simulation stream.
#[derive(Debug, Clone)]
pub struct SimRng {
    inner: SmallRng,
}

impl SimRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            inner: SmallRng::seed_from_u64(seed),
        }
    }

    /// Uniform float in the half-open range `[a, b)`.
    ///
    /// Returns `a` when the range is empty or inverted, so degenerate
    /// parameter combinations (e.g. zero mutation sigma) stay deterministic.
    pub fn uniform(&mut self, a: f32, b: f32) -> f32 {
        if b <= a {
            return a;
        }
        self.inner.random_range(a..b)
    }

    /// Uniform integer in the closed range `[a, b]`.
    pub fn uniform_int(&mut self, a: i64, b: i64) -> i64 {
        if b <= a {
            return a;
        }
        self.inner.random_range(a..=b)
    }

    /// Bernoulli draw: true with probability `p`.
    pub fn chance(&mut self, p: f32) -> bool {
        self.uniform(0.0, 1.0) < p
    }
}
