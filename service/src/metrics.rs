use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };

        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Counters for the join and resolution paths.
#[derive(Default)]
pub struct ChallengeMetrics {
    joins_accepted: AtomicU64,
    joins_too_early: AtomicU64,
    joins_invalid: AtomicU64,
    joins_failed: AtomicU64,
    resolutions_won: AtomicU64,
    resolutions_lost: AtomicU64,
    resolutions_skipped: AtomicU64,
    resolutions_failed: AtomicU64,
    resolutions_recovered: AtomicU64,
    join_latency: LatencyMetrics,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChallengeMetricsSnapshot {
    pub joins_accepted: u64,
    pub joins_too_early: u64,
    pub joins_invalid: u64,
    pub joins_failed: u64,
    pub resolutions_won: u64,
    pub resolutions_lost: u64,
    pub resolutions_skipped: u64,
    pub resolutions_failed: u64,
    pub resolutions_recovered: u64,
    pub join_latency: LatencySnapshot,
}

impl ChallengeMetrics {
    pub fn snapshot(&self) -> ChallengeMetricsSnapshot {
        ChallengeMetricsSnapshot {
            joins_accepted: self.joins_accepted.load(Ordering::Relaxed),
            joins_too_early: self.joins_too_early.load(Ordering::Relaxed),
            joins_invalid: self.joins_invalid.load(Ordering::Relaxed),
            joins_failed: self.joins_failed.load(Ordering::Relaxed),
            resolutions_won: self.resolutions_won.load(Ordering::Relaxed),
            resolutions_lost: self.resolutions_lost.load(Ordering::Relaxed),
            resolutions_skipped: self.resolutions_skipped.load(Ordering::Relaxed),
            resolutions_failed: self.resolutions_failed.load(Ordering::Relaxed),
            resolutions_recovered: self.resolutions_recovered.load(Ordering::Relaxed),
            join_latency: self.join_latency.snapshot(),
        }
    }

    pub fn inc_join_accepted(&self) {
        self.joins_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_too_early(&self) {
        self.joins_too_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_invalid(&self) {
        self.joins_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_failed(&self) {
        self.joins_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_won(&self) {
        self.resolutions_won.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_lost(&self) {
        self.resolutions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_skipped(&self) {
        self.resolutions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_failed(&self) {
        self.resolutions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_resolutions_recovered(&self, count: u64) {
        self.resolutions_recovered
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_join_latency(&self, duration: Duration) {
        self.join_latency.record(duration);
    }
}

/// Requests turned away by the HTTP middleware stack.
#[derive(Default)]
pub struct HttpMetrics {
    reject_origin: AtomicU64,
    reject_body_limit: AtomicU64,
    reject_rate_limit: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub reject_origin: u64,
    pub reject_body_limit: u64,
    pub reject_rate_limit: u64,
}

impl HttpMetrics {
    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            reject_origin: self.reject_origin.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
        }
    }

    /// Counts a response if its status is one the middleware rejects with.
    pub fn record_status(&self, status: u16) {
        let counter = match status {
            403 => &self.reject_origin,
            413 => &self.reject_body_limit,
            429 => &self.reject_rate_limit,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
