//! Deferred resolution of joined challenges.
//!
//! Every committed join has a durable job row. A per-join task resolves it
//! once it is due; `recover` re-arms jobs left over from a previous process
//! and the sweeper picks up anything that slipped through. Resolution is
//! idempotent, so running a job twice is harmless.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::backoff::retry_delay;
use crate::store::{PendingResolution, StoreError};
use crate::Service;

impl Service {
    /// Spawns a task that resolves `job` once it is due, re-arming itself
    /// after each backoff until the attempt limit is reached.
    pub fn schedule(self: &Arc<Self>, job: PendingResolution) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let wait_ms = job.due_at.saturating_sub(service.clock.now_ms());
            if wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            if let Some(retry) = service.run_resolution(job).await {
                service.schedule(retry);
            }
        });
    }

    /// Schedules every pending job still under the attempt limit.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, StoreError> {
        let max_attempts = self.config.max_resolution_attempts();
        let jobs = self
            .with_store(move |store| store.due_resolutions(u64::MAX, max_attempts, None))
            .await?;
        let count = jobs.len();
        self.metrics.add_resolutions_recovered(count as u64);
        if count > 0 {
            info!(count, "recovered pending resolutions");
        }
        for job in jobs {
            self.schedule(job);
        }
        Ok(count)
    }

    /// Runs `sweep` every `sweep_interval_ms` until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(service.config.sweep_interval_ms()));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = service.sweep().await {
                            warn!(error = %err, "resolution sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("resolution sweeper stopped");
        })
    }

    /// Resolves jobs overdue by more than the grace period. Returns how many
    /// were attempted. A job that fails here waits for a later sweep, so its
    /// retry gap is at least the grace period.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.config.sweep_grace_ms);
        let max_attempts = self.config.max_resolution_attempts();
        let limit = self.config.sweep_batch_size.filter(|size| *size > 0);
        let jobs = self
            .with_store(move |store| store.due_resolutions(cutoff, max_attempts, limit))
            .await?;
        let count = jobs.len();
        for job in jobs {
            self.run_resolution(job).await;
        }
        Ok(count)
    }

    /// Resolves `job`, pushing it back with backoff on failure. Returns the
    /// deferred job while it still has attempts left.
    async fn run_resolution(&self, job: PendingResolution) -> Option<PendingResolution> {
        let err = match self.resolve(&job).await {
            Ok(_) => return None,
            Err(err) => err,
        };

        let attempts = job.attempts.saturating_add(1);
        let delay = {
            let mut rng = rand::thread_rng();
            retry_delay(
                &mut rng,
                self.config.retry_base_ms,
                self.config.retry_max_ms,
                attempts,
            )
        };
        let due_at = self
            .clock
            .now_ms()
            .saturating_add(delay.as_millis() as u64);

        let exhausted = attempts >= self.config.max_resolution_attempts();
        if exhausted {
            error!(
                challenge_id = job.challenge_id,
                player_id = job.player_id,
                attempts,
                error = %err,
                "resolution attempts exhausted; challenge left unresolved"
            );
        } else {
            warn!(
                challenge_id = job.challenge_id,
                player_id = job.player_id,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "resolution failed"
            );
        }

        let challenge_id = job.challenge_id;
        if let Err(defer_err) = self
            .with_store(move |store| store.defer_resolution(challenge_id, due_at, attempts))
            .await
        {
            error!(challenge_id, error = %defer_err, "failed to defer resolution");
            return None;
        }
        if exhausted {
            return None;
        }
        Some(PendingResolution {
            due_at,
            attempts,
            ..job
        })
    }
}
