use endless_types::{JOIN_COOLDOWN_MS, RESOLUTION_DELAY_MS};
use serde::Serialize;
use std::path::PathBuf;

pub const DEFAULT_RESOLUTION_DELAY_MS: u64 = RESOLUTION_DELAY_MS;
pub const DEFAULT_JOIN_COOLDOWN_MS: u64 = JOIN_COOLDOWN_MS;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_SWEEP_GRACE_MS: u64 = 30_000;
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 256;
pub const DEFAULT_MAX_RESOLUTION_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_MS: u64 = 60_000;
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;
pub const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 100;
pub const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 200;
pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 16 * 1024;

#[derive(Clone, Debug, Serialize)]
pub struct ServiceConfig {
    pub database_path: Option<PathBuf>,
    /// Skipped so credentials never reach `/config`.
    #[serde(skip)]
    pub database_url: Option<String>,
    pub resolution_delay_ms: u64,
    pub join_cooldown_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_grace_ms: u64,
    pub sweep_batch_size: Option<usize>,
    pub max_resolution_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub deterministic_seed: Option<u64>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            database_url: None,
            resolution_delay_ms: DEFAULT_RESOLUTION_DELAY_MS,
            join_cooldown_ms: DEFAULT_JOIN_COOLDOWN_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            sweep_grace_ms: DEFAULT_SWEEP_GRACE_MS,
            sweep_batch_size: Some(DEFAULT_SWEEP_BATCH_SIZE),
            max_resolution_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
            deterministic_seed: None,
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
        }
    }
}

impl ServiceConfig {
    /// Page size for list reads: absent or zero means the default, anything
    /// larger than the cap is clamped.
    pub fn list_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => DEFAULT_LIST_LIMIT,
            Some(limit) => limit.min(MAX_LIST_LIMIT),
        }
    }

    pub fn max_resolution_attempts(&self) -> u32 {
        self.max_resolution_attempts.max(1)
    }

    pub fn sweep_interval_ms(&self) -> u64 {
        self.sweep_interval_ms.max(1)
    }
}
