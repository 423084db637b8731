use crate::Amount;

/// The only stake a challenge accepts (20.01).
pub const STAKE: Amount = Amount::from_cents(2_001);

/// Minimum gap between two joins by the same player.
pub const JOIN_COOLDOWN_MS: u64 = 60_000;

/// Delay between a committed join and its resolution.
pub const RESOLUTION_DELAY_MS: u64 = 30_000;

/// Win chance of a challenge carrying no pity from earlier losses (1%).
pub const BASE_WIN_PROBABILITY: f64 = 0.01;

/// Row id of the singleton prize pool.
pub const PRIZE_POOL_ID: i64 = 1;
