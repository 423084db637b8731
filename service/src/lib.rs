//! Challenge join-and-resolve engine.
//!
//! A player stakes a fixed amount to join a challenge; the stake goes into a
//! shared prize pool and, after a delay, the challenge is resolved. A win pays
//! out the whole pool, a loss raises the player's odds for their next join.

use std::sync::Arc;

mod api;
mod backoff;
mod clock;
mod config;
mod cooldown;
mod draw;
mod join;
mod metrics;
mod query;
mod resolver;
mod scheduler;
mod store;

pub use api::Api;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use cooldown::Cooldown;
pub use draw::{Draw, FixedDraw, SeededDraw, ThreadDraw};
pub use join::JoinError;
pub use metrics::{ChallengeMetrics, ChallengeMetricsSnapshot, HttpMetrics, HttpMetricsSnapshot, LatencySnapshot};
pub use resolver::{decide, Outcome, ResolveError};
pub use store::{
    Admission, JoinReceipt, LastChallenge, LedgerStore, ListQuery, NewChallenge,
    PendingResolution, PostgresLedger, Resolution, Settlement, SqliteLedger, StoreError,
};

pub struct Service {
    pub config: ServiceConfig,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    draw: Arc<dyn Draw>,
    cooldown: Cooldown,
    metrics: ChallengeMetrics,
    http_metrics: HttpMetrics,
}

impl Service {
    /// Service on the wall clock, drawing from the OS RNG unless the config
    /// pins a seed.
    pub fn new(config: ServiceConfig, store: Arc<dyn LedgerStore>) -> Self {
        let draw: Arc<dyn Draw> = match config.deterministic_seed {
            Some(seed) => Arc::new(SeededDraw::new(seed)),
            None => Arc::new(ThreadDraw),
        };
        Self::with_sources(config, store, Arc::new(SystemClock), draw)
    }

    pub fn with_sources(
        config: ServiceConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        draw: Arc<dyn Draw>,
    ) -> Self {
        let cooldown = Cooldown::new(config.join_cooldown_ms);
        Self {
            config,
            store,
            clock,
            draw,
            cooldown,
            metrics: ChallengeMetrics::default(),
            http_metrics: HttpMetrics::default(),
        }
    }

    pub fn metrics_snapshot(&self) -> ChallengeMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    /// Runs one ledger call on the blocking pool.
    pub(crate) async fn with_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LedgerStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|err| StoreError::Worker(err.to_string()))?
    }
}
