use endless_types::{JoinRequest, RequestError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{Admission, JoinReceipt, NewChallenge, StoreError};
use crate::Service;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("invalid join request: {0}")]
    Validation(#[from] RequestError),
    #[error("joined too recently; retry in {retry_after_ms} ms")]
    TooEarly { retry_after_ms: u64 },
    #[error("join transaction failed: {0}")]
    Transaction(#[from] StoreError),
}

impl Service {
    /// Admits the join and schedules its resolution.
    pub async fn join(self: &Arc<Self>, request: JoinRequest) -> Result<JoinReceipt, JoinError> {
        let started = Instant::now();
        let result = self.admit(request).await;
        self.metrics.record_join_latency(started.elapsed());

        match &result {
            Ok(receipt) => {
                self.metrics.inc_join_accepted();
                info!(
                    challenge_id = receipt.challenge_id,
                    player_id = receipt.player_id,
                    probability = receipt.probability,
                    pool = %receipt.pool,
                    "challenge joined"
                );
                self.schedule(receipt.pending());
            }
            Err(JoinError::Validation(err)) => {
                self.metrics.inc_join_invalid();
                info!(player_id = request.player_id, error = %err, "join rejected");
            }
            Err(JoinError::TooEarly { retry_after_ms }) => {
                self.metrics.inc_join_too_early();
                info!(
                    player_id = request.player_id,
                    retry_after_ms, "join rejected: cooldown"
                );
            }
            Err(JoinError::Transaction(err)) => {
                self.metrics.inc_join_failed();
                warn!(player_id = request.player_id, error = %err, "join failed");
            }
        }
        result
    }

    /// Validates, checks the cooldown and commits the join without
    /// scheduling anything.
    pub(crate) async fn admit(&self, request: JoinRequest) -> Result<JoinReceipt, JoinError> {
        request.validate()?;

        let now = self.clock.now_ms();
        let player_id = request.player_id;
        let last = self
            .with_store(move |store| store.last_challenge(player_id))
            .await?;
        let retry_after_ms = self.cooldown.remaining(last.as_ref(), now);
        if retry_after_ms > 0 {
            return Err(JoinError::TooEarly { retry_after_ms });
        }

        let entry = NewChallenge {
            player_id,
            amount: request.amount,
            created_at: now,
            due_at: now.saturating_add(self.config.resolution_delay_ms),
        };
        let cooldown = self.cooldown;
        match self
            .with_store(move |store| store.join(&entry, &cooldown))
            .await?
        {
            Admission::Admitted(receipt) => Ok(receipt),
            Admission::TooEarly { retry_after_ms } => Err(JoinError::TooEarly { retry_after_ms }),
        }
    }
}
