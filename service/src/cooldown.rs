//! Per-player join cooldown.

use crate::store::LastChallenge;

/// A player may join again once `window_ms` has passed since their most
/// recent challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cooldown {
    window_ms: u64,
}

impl Cooldown {
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Milliseconds until the player may join; `0` means now.
    ///
    /// A last challenge stamped in the future (clock skew) counts as just
    /// created.
    pub fn remaining(&self, last: Option<&LastChallenge>, now_ms: u64) -> u64 {
        let Some(last) = last else {
            return 0;
        };
        let elapsed = now_ms.saturating_sub(last.created_at);
        self.window_ms.saturating_sub(elapsed)
    }
}
