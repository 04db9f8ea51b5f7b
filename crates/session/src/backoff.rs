//! Retry delay growth with bounded random jitter.

use cl_domain::config::BackoffConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Computes the next retry deadline for a stage.
///
/// A sample `x` is drawn from `[0, jitter_span]` and the candidate delay is
/// `original * (1 + x^4 / jitter_divisor)`, rounded up to whole ticks.
/// Draws repeat until the candidate exceeds the current delay.  If
/// `max_draws` draws all fall short the result is `current + 1`, so the
/// delay always strictly grows.
#[derive(Debug)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    rng: StdRng,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter, for tests and reproducible runs.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_delay(&mut self, original: u32, current: u32) -> u32 {
        let span = self.config.jitter_span.max(0.0);
        let base = original.max(1) as f64;

        for _ in 0..self.config.max_draws {
            let x: f64 = if span > 0.0 {
                self.rng.gen_range(0.0..=span)
            } else {
                0.0
            };
            let candidate = (base * (1.0 + x.powi(4) / self.config.jitter_divisor)).ceil();
            if candidate > current as f64 && candidate <= u32::MAX as f64 {
                return candidate as u32;
            }
        }

        tracing::trace!(original, current, "jitter draws exhausted, stepping by one");
        current.saturating_add(1)
    }
}

/// Cap `delay` at `multiplier` times the stage's original deadline.
pub fn clamp_to_ceiling(delay: u32, original: u32, multiplier: u32) -> u32 {
    delay.min(original.saturating_mul(multiplier))
}
