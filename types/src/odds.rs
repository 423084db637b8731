//! Pity-escalated win chance.
//!
//! Every loss adds [`BASE_WIN_PROBABILITY`] to the probability carried into
//! the player's next challenge; a win resets it to zero.

use crate::BASE_WIN_PROBABILITY;

/// Win chance for a challenge that carries `carried` from earlier losses.
pub fn effective_probability(carried: f64) -> f64 {
    if !carried.is_finite() {
        return BASE_WIN_PROBABILITY;
    }
    (BASE_WIN_PROBABILITY + carried.max(0.0)).clamp(0.0, 1.0)
}

/// A uniform draw in `[0, 1)` wins when it falls under the effective chance.
pub fn is_win(sample: f64, effective: f64) -> bool {
    sample < effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_attempt_uses_base_rate() {
        assert_eq!(effective_probability(0.0), BASE_WIN_PROBABILITY);
    }

    #[test]
    fn carried_probability_is_added() {
        assert!((effective_probability(0.10) - 0.11).abs() < 1e-12);
        assert!((effective_probability(0.49) - 0.50).abs() < 1e-12);
    }

    #[test]
    fn saturates_at_certainty() {
        assert_eq!(effective_probability(5.0), 1.0);
        assert!(is_win(0.999_999, effective_probability(5.0)));
    }

    #[test]
    fn garbage_carry_falls_back_to_base() {
        assert_eq!(effective_probability(f64::NAN), BASE_WIN_PROBABILITY);
        assert_eq!(effective_probability(-0.5), BASE_WIN_PROBABILITY);
    }

    #[test]
    fn draw_at_threshold_loses() {
        assert!(is_win(0.0099, 0.01));
        assert!(!is_win(0.01, 0.01));
    }

    proptest! {
        #[test]
        fn losses_never_lower_the_odds(losses in 0usize..200) {
            let mut carried = 0.0;
            let mut previous = effective_probability(carried);
            for _ in 0..losses {
                carried = effective_probability(carried);
                let next = effective_probability(carried);
                prop_assert!(next >= previous);
                previous = next;
            }
        }
    }
}
