//! Durable ledger: challenges, the singleton prize pool and pending
//! resolution jobs.

use endless_types::{Amount, Challenge, ChallengeId, ChallengeStatus, PlayerId, PrizePool};
use thiserror::Error;

use crate::cooldown::Cooldown;
use crate::resolver::Outcome;

mod pg;
mod sqlite;
pub use pg::PostgresLedger;
pub use sqlite::SqliteLedger;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] ::postgres::Error),
    #[error("prize pool row is missing")]
    PoolMissing,
    #[error("prize pool would overflow")]
    PoolOverflow,
    #[error("corrupt {column} in challenge {id}: {value}")]
    Corrupt {
        column: &'static str,
        id: i64,
        value: String,
    },
    #[error("{label} out of range: {value}")]
    OutOfRange { label: &'static str, value: u64 },
    #[error("invalid postgres url: {0}")]
    InvalidUrl(String),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger connection closed")]
    Closed,
    #[error("storage worker failed: {0}")]
    Worker(String),
}

/// Most recent challenge of a player, as seen by the cooldown gate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LastChallenge {
    pub challenge_id: ChallengeId,
    pub created_at: u64,
    pub probability: f64,
    pub status: ChallengeStatus,
}

impl LastChallenge {
    /// Probability a new challenge inherits from this one.
    pub fn carried_probability(&self) -> f64 {
        if self.probability.is_finite() && self.probability > 0.0 {
            self.probability
        } else {
            0.0
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NewChallenge {
    pub player_id: PlayerId,
    pub amount: Amount,
    pub created_at: u64,
    pub due_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JoinReceipt {
    pub challenge_id: ChallengeId,
    pub player_id: PlayerId,
    pub status: ChallengeStatus,
    pub probability: f64,
    pub created_at: u64,
    pub due_at: u64,
    /// Pool balance right after this stake was added.
    pub pool: Amount,
}

impl JoinReceipt {
    pub fn pending(&self) -> PendingResolution {
        PendingResolution {
            challenge_id: self.challenge_id,
            player_id: self.player_id,
            probability: self.probability,
            due_at: self.due_at,
            attempts: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Admission {
    Admitted(JoinReceipt),
    TooEarly { retry_after_ms: u64 },
}

/// Durable job record: one per joined challenge until it is resolved.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingResolution {
    pub challenge_id: ChallengeId,
    pub player_id: PlayerId,
    pub probability: f64,
    pub due_at: u64,
    pub attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Resolution {
    pub challenge_id: ChallengeId,
    pub player_id: PlayerId,
    pub outcome: Outcome,
    pub resolved_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Settlement {
    Won { prize: Amount },
    Lost { probability: f64 },
    AlreadyResolved,
    Missing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: usize,
    pub player_id: Option<PlayerId>,
}

/// Storage seam of the challenge engine.
///
/// Every method is one unit of work; `join` and `resolve` each run inside a
/// single transaction and leave nothing behind when they fail.
pub trait LedgerStore: Send + Sync {
    fn last_challenge(&self, player_id: PlayerId) -> Result<Option<LastChallenge>, StoreError>;

    /// Re-checks the cooldown under the pool lock, inserts the challenge,
    /// adds its stake to the pool and records the pending resolution.
    fn join(&self, entry: &NewChallenge, cooldown: &Cooldown) -> Result<Admission, StoreError>;

    /// Applies an outcome to a still-unresolved challenge and drops its job.
    fn resolve(&self, resolution: &Resolution) -> Result<Settlement, StoreError>;

    /// Jobs due at or before `due_before` with fewer than `max_attempts` tries.
    fn due_resolutions(
        &self,
        due_before: u64,
        max_attempts: u32,
        limit: Option<usize>,
    ) -> Result<Vec<PendingResolution>, StoreError>;

    fn defer_resolution(
        &self,
        challenge_id: ChallengeId,
        due_at: u64,
        attempts: u32,
    ) -> Result<(), StoreError>;

    fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError>;

    /// Newest first.
    fn list_challenges(&self, query: &ListQuery) -> Result<Vec<Challenge>, StoreError>;

    fn prize_pool(&self) -> Result<PrizePool, StoreError>;
}

const CHALLENGE_COLUMNS: &str = "id, player_id, amount_cents, status, won, created_at_ms, \
     probability, resolved_at_ms, prize_cents";

/// Raw challenge columns in `CHALLENGE_COLUMNS` order.
struct ChallengeRow {
    id: i64,
    player_id: i64,
    amount_cents: i64,
    status: i16,
    won: bool,
    created_at_ms: i64,
    probability: f64,
    resolved_at_ms: Option<i64>,
    prize_cents: Option<i64>,
}

impl ChallengeRow {
    fn into_challenge(self) -> Result<Challenge, StoreError> {
        let id = self.id;
        Ok(Challenge {
            id,
            player_id: self.player_id,
            amount: Amount::from_cents(self.amount_cents),
            status: status_from_code(self.status, id)?,
            won: self.won,
            created_at: to_u64(self.created_at_ms, "created_at_ms", id)?,
            probability: self.probability,
            resolved_at: self
                .resolved_at_ms
                .map(|value| to_u64(value, "resolved_at_ms", id))
                .transpose()?,
            prize: self.prize_cents.map(Amount::from_cents),
        })
    }
}

fn status_from_code(code: i16, id: i64) -> Result<ChallengeStatus, StoreError> {
    ChallengeStatus::from_code(code).ok_or_else(|| StoreError::Corrupt {
        column: "status",
        id,
        value: code.to_string(),
    })
}

fn to_u64(value: i64, column: &'static str, id: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        id,
        value: value.to_string(),
    })
}

fn to_i64(value: u64, label: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { label, value })
}

fn to_i64_usize(value: usize, label: &'static str) -> Result<i64, StoreError> {
    to_i64(value as u64, label)
}

/// Cutoffs past the storable range mean "everything".
fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn attempts_from(value: i64, id: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        column: "attempts",
        id,
        value: value.to_string(),
    })
}
