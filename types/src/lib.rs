//! Types shared by the endless challenge service and its clients.

pub mod amount;
pub use amount::{Amount, AmountError};
pub mod api;
pub use api::{ChallengesQuery, Eligibility, ErrorResponse, JoinRequest, JoinResponse, RequestError};
pub mod challenge;
pub use challenge::{Challenge, ChallengeId, ChallengeStatus, PlayerId, PrizePool};
mod constants;
pub use constants::*;
pub mod odds;
