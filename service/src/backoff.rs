use rand::{Rng, RngCore};
use std::time::Duration;

/// Equal jitter: the delay lands in `[backoff/2, backoff]`.
pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Delay before retry number `attempts` (1-based), doubling from `base_ms`
/// up to `max_ms`.
pub(crate) fn retry_delay(rng: &mut impl RngCore, base_ms: u64, max_ms: u64, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let backoff_ms = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    jittered_backoff(rng, Duration::from_millis(backoff_ms))
}
