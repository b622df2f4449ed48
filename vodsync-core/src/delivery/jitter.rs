use std::sync::Mutex;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Source of the random part of a retry delay.
pub trait JitterSource: Send + Sync {
    /// Uniform draw from `[0, max]`.
    fn draw(&self, max: Duration) -> Duration;
}

#[derive(Debug, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn draw(&self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Reproducible jitter for tests and replays.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn draw(&self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

#[derive(Debug, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn draw(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_jitter_is_reproducible_and_bounded() {
        let max = Duration::from_millis(500);
        let a = SeededJitter::new(42);
        let b = SeededJitter::new(42);
        for _ in 0..32 {
            let left = a.draw(max);
            assert_eq!(left, b.draw(max));
            assert!(left <= max);
        }
    }

    #[test]
    fn zero_bound_draws_zero() {
        assert_eq!(ThreadRngJitter.draw(Duration::ZERO), Duration::ZERO);
        assert_eq!(SeededJitter::new(1).draw(Duration::ZERO), Duration::ZERO);
    }
}
