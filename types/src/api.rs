use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Amount, ChallengeId, ChallengeStatus, PlayerId, STAKE};

/// Body of a join request.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub player_id: PlayerId,
    pub amount: Amount,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("player_id must be positive (got {0})")]
    InvalidPlayer(PlayerId),
    #[error("amount must equal {expected} (got {got})")]
    WrongStake { expected: Amount, got: Amount },
}

impl JoinRequest {
    pub fn new(player_id: PlayerId, amount: Amount) -> Self {
        Self { player_id, amount }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.player_id <= 0 {
            return Err(RequestError::InvalidPlayer(self.player_id));
        }
        if self.amount != STAKE {
            return Err(RequestError::WrongStake {
                expected: STAKE,
                got: self.amount,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub challenge_id: ChallengeId,
    pub status: ChallengeStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Whether a player may join right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub player_id: PlayerId,
    /// `Ready` when a join would be admitted, `Joined` for the rest of the
    /// cooldown. This is the gate's state, not the last challenge row's:
    /// it stays `Joined` after that challenge is already `Won` or `Lost`.
    pub status: ChallengeStatus,
    pub retry_after_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
}
