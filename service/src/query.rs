use endless_types::{Challenge, ChallengeId, ChallengeStatus, ChallengesQuery, Eligibility, PlayerId, PrizePool};

use crate::store::{ListQuery, StoreError};
use crate::Service;

impl Service {
    /// `Joined` while the player's cooldown is running, `Ready` otherwise,
    /// whatever the last challenge's own status is.
    ///
    /// A storage failure is an error, never "ready".
    pub async fn eligibility(&self, player_id: PlayerId) -> Result<Eligibility, StoreError> {
        let now = self.clock.now_ms();
        let last = self
            .with_store(move |store| store.last_challenge(player_id))
            .await?;
        let retry_after_ms = self.cooldown.remaining(last.as_ref(), now);
        let status = if retry_after_ms > 0 {
            ChallengeStatus::Joined
        } else {
            ChallengeStatus::Ready
        };
        Ok(Eligibility {
            player_id,
            status,
            retry_after_ms,
        })
    }

    pub async fn challenges(&self, query: ChallengesQuery) -> Result<Vec<Challenge>, StoreError> {
        let query = ListQuery {
            limit: self.config.list_limit(query.limit),
            player_id: query.player_id,
        };
        self.with_store(move |store| store.list_challenges(&query))
            .await
    }

    pub async fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError> {
        self.with_store(move |store| store.challenge(id)).await
    }

    pub async fn prize_pool(&self) -> Result<PrizePool, StoreError> {
        self.with_store(|store| store.prize_pool()).await
    }
}
