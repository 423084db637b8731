//! Decides and settles one challenge.

use endless_types::odds::{effective_probability, is_win};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{PendingResolution, Resolution, Settlement, StoreError};
use crate::Service;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    Won,
    /// Carries the escalated probability the player's next join inherits.
    Lost { probability: f64 },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to settle challenge {challenge_id}: {source}")]
    Store {
        challenge_id: i64,
        #[source]
        source: StoreError,
    },
}

/// Win iff `sample` falls under the escalated chance; a loss records that
/// chance so the next join starts from it.
pub fn decide(probability_at_join: f64, sample: f64) -> Outcome {
    let effective = effective_probability(probability_at_join);
    if is_win(sample, effective) {
        Outcome::Won
    } else {
        Outcome::Lost {
            probability: effective,
        }
    }
}

impl Service {
    /// Draws an outcome for `job` and commits it.
    ///
    /// Settling an already-resolved or unknown challenge changes nothing and
    /// is reported as such.
    pub async fn resolve(&self, job: &PendingResolution) -> Result<Settlement, ResolveError> {
        let outcome = decide(job.probability, self.draw.sample());
        let resolution = Resolution {
            challenge_id: job.challenge_id,
            player_id: job.player_id,
            outcome,
            resolved_at: self.clock.now_ms(),
        };

        let settlement = match self
            .with_store(move |store| store.resolve(&resolution))
            .await
        {
            Ok(settlement) => settlement,
            Err(source) => {
                self.metrics.inc_resolution_failed();
                return Err(ResolveError::Store {
                    challenge_id: job.challenge_id,
                    source,
                });
            }
        };

        match settlement {
            Settlement::Won { prize } => {
                self.metrics.inc_resolution_won();
                info!(
                    challenge_id = job.challenge_id,
                    player_id = job.player_id,
                    prize = %prize,
                    "challenge won"
                );
            }
            Settlement::Lost { probability } => {
                self.metrics.inc_resolution_lost();
                debug!(
                    challenge_id = job.challenge_id,
                    player_id = job.player_id,
                    probability,
                    "challenge lost"
                );
            }
            Settlement::AlreadyResolved => {
                self.metrics.inc_resolution_skipped();
                debug!(challenge_id = job.challenge_id, "challenge already resolved");
            }
            Settlement::Missing => {
                self.metrics.inc_resolution_skipped();
                warn!(
                    challenge_id = job.challenge_id,
                    player_id = job.player_id,
                    "resolution for unknown challenge dropped"
                );
            }
        }
        Ok(settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, T0};
    use crate::{JoinReceipt, LedgerStore, ServiceConfig};
    use endless_types::{Amount, ChallengeStatus, JoinRequest, STAKE};

    async fn joined(h: &crate::test_support::Harness, player_id: i64) -> JoinReceipt {
        h.service
            .admit(JoinRequest::new(player_id, STAKE))
            .await
            .unwrap()
    }

    #[test]
    fn escalated_chance_decides() {
        assert_eq!(decide(0.0, 0.005), Outcome::Won);
        assert_eq!(decide(0.0, 0.5), Outcome::Lost { probability: 0.01 });
        // 0.3 loses at the base rate alone but wins once losses are carried.
        assert_eq!(decide(0.49, 0.3), Outcome::Won);
    }

    #[test]
    fn certain_chance_always_wins() {
        assert_eq!(decide(0.99, 0.999_999), Outcome::Won);
    }

    #[tokio::test]
    async fn scenario_d_forced_win_resets_pool() {
        let h = harness(ServiceConfig::default());
        let other = joined(&h, 7).await;
        let receipt = joined(&h, 1001).await;
        assert_eq!(receipt.pool, Amount::from_cents(4_002));

        h.draw.set(0.0);
        let job = PendingResolution {
            probability: 0.49,
            ..receipt.pending()
        };
        let settlement = h.service.resolve(&job).await.unwrap();
        assert_eq!(
            settlement,
            Settlement::Won {
                prize: Amount::from_cents(4_002)
            }
        );

        let challenge = h.ledger.challenge(receipt.challenge_id).unwrap().unwrap();
        assert!(challenge.won);
        assert_eq!(challenge.status, ChallengeStatus::Won);
        assert_eq!(challenge.probability, 0.0);
        assert_eq!(challenge.prize, Some(Amount::from_cents(4_002)));
        assert_eq!(challenge.resolved_at, Some(T0));
        assert_eq!(h.ledger.prize_pool().unwrap().amount, Amount::ZERO);

        // The other player's challenge is still open.
        let other = h.ledger.challenge(other.challenge_id).unwrap().unwrap();
        assert_eq!(other.status, ChallengeStatus::Joined);
        assert_eq!(h.service.metrics_snapshot().resolutions_won, 1);
    }

    #[tokio::test]
    async fn scenario_e_forced_loss_escalates() {
        let h = harness(ServiceConfig::default());
        let receipt = joined(&h, 1001).await;

        h.draw.set(0.99);
        let job = PendingResolution {
            probability: 0.10,
            ..receipt.pending()
        };
        let settlement = h.service.resolve(&job).await.unwrap();
        let Settlement::Lost { probability } = settlement else {
            panic!("expected a loss, got {settlement:?}");
        };
        assert!((probability - 0.11).abs() < 1e-12);

        let challenge = h.ledger.challenge(receipt.challenge_id).unwrap().unwrap();
        assert!(!challenge.won);
        assert_eq!(challenge.status, ChallengeStatus::Lost);
        assert!((challenge.probability - 0.11).abs() < 1e-12);
        assert_eq!(h.ledger.prize_pool().unwrap().amount, STAKE);
    }

    #[tokio::test]
    async fn second_resolution_is_skipped() {
        let h = harness(ServiceConfig::default());
        let receipt = joined(&h, 1001).await;
        h.draw.set(0.0);
        h.service.resolve(&receipt.pending()).await.unwrap();

        let again = h.service.resolve(&receipt.pending()).await.unwrap();
        assert_eq!(again, Settlement::AlreadyResolved);
        let snapshot = h.service.metrics_snapshot();
        assert_eq!(snapshot.resolutions_won, 1);
        assert_eq!(snapshot.resolutions_skipped, 1);
    }
}
