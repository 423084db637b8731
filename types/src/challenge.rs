use serde::{Deserialize, Serialize};

use crate::{Amount, PRIZE_POOL_ID};

pub type PlayerId = i64;
pub type ChallengeId = i64;

/// Lifecycle of a challenge.
///
/// `Ready` describes a player who may join; stored rows start at `Joined`
/// and move exactly once to `Won` or `Lost`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Ready,
    Joined,
    Won,
    Lost,
}

impl ChallengeStatus {
    /// Integer form used in storage. `Ready`/`Joined` keep their historical codes.
    pub fn code(self) -> i16 {
        match self {
            Self::Ready => 0,
            Self::Joined => 1,
            Self::Won => 2,
            Self::Lost => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Ready),
            1 => Some(Self::Joined),
            2 => Some(Self::Won),
            3 => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Joined => "joined",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }
}

/// One stake-and-wait attempt by a player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub player_id: PlayerId,
    pub amount: Amount,
    pub status: ChallengeStatus,
    pub won: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub probability: f64,
    #[serde(default)]
    pub resolved_at: Option<u64>,
    #[serde(default)]
    pub prize: Option<Amount>,
}

impl Challenge {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizePool {
    pub id: i64,
    pub amount: Amount,
}

impl PrizePool {
    pub fn new(amount: Amount) -> Self {
        Self {
            id: PRIZE_POOL_ID,
            amount,
        }
    }
}
