//! Sources of the uniform sample that decides a challenge.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Uniform sample in `[0, 1)`.
pub trait Draw: Send + Sync {
    fn sample(&self) -> f64;
}

/// OS-seeded thread RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadDraw;

impl Draw for ThreadDraw {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Reproducible draws from a fixed seed.
pub struct SeededDraw {
    rng: Mutex<StdRng>,
}

impl SeededDraw {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Draw for SeededDraw {
    fn sample(&self) -> f64 {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen::<f64>()
    }
}

/// Always returns the last value it was set to.
#[derive(Debug)]
pub struct FixedDraw {
    bits: AtomicU64,
}

impl FixedDraw {
    pub fn new(sample: f64) -> Self {
        Self {
            bits: AtomicU64::new(sample.to_bits()),
        }
    }

    pub fn set(&self, sample: f64) {
        self.bits.store(sample.to_bits(), Ordering::SeqCst);
    }
}

impl Draw for FixedDraw {
    fn sample(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
