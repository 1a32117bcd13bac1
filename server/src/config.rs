use gauntlet_types::constants::{
    DEFAULT_IDEMPOTENCY_BODY_LIMIT_BYTES, DEFAULT_IDEMPOTENCY_TTL_MS, DEFAULT_MATCH_SPACING_MS,
    DEFAULT_SWEEP_INTERVAL_MS, HOUR_MS, MINUTE_MS, PRIZE_DISTRIBUTION_DELAY_MS,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::guard::Limit;

const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 10 * MINUTE_MS;
const DEFAULT_REGISTRATION_WINDOW_MS: u64 = MINUTE_MS;
const DEFAULT_REGISTRATION_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_REFERRAL_WINDOW_MS: u64 = HOUR_MS;
const DEFAULT_REFERRAL_MAX_PER_CALLER: u32 = 5;
const DEFAULT_REFERRAL_MAX_PER_IP: u32 = 10;
const DEFAULT_REFERRAL_MAX_PER_DEVICE: u32 = 5;
const DEFAULT_REFERRAL_MAX_PER_CODE: u32 = 25;
const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 50;
const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 200;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_COUNTERS_REDIS_PREFIX: &str = "gauntlet:guard:";

#[derive(Clone, Debug, Serialize)]
pub struct ArenaConfig {
    pub database_path: Option<PathBuf>,
    pub sweep_interval_ms: u64,
    pub maintenance_interval_ms: u64,
    pub match_spacing_ms: u64,
    pub prize_distribution_delay_ms: u64,
    pub idempotency_ttl_ms: u64,
    pub idempotency_body_limit_bytes: usize,
    pub registration_window_ms: u64,
    pub registration_max_attempts: u32,
    pub referral_window_ms: u64,
    pub referral_max_per_caller: u32,
    pub referral_max_per_ip: u32,
    pub referral_max_per_device: u32,
    pub referral_max_per_code: u32,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
    /// Browser origins accepted when `ALLOWED_HTTP_ORIGINS` is unset.
    pub allowed_origins: Vec<String>,
    /// Accept requests without an `Origin` header (server-to-server callers).
    pub allow_no_origin: bool,
    pub counters_redis_url: Option<String>,
    pub counters_redis_prefix: Option<String>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            maintenance_interval_ms: DEFAULT_MAINTENANCE_INTERVAL_MS,
            match_spacing_ms: DEFAULT_MATCH_SPACING_MS,
            prize_distribution_delay_ms: PRIZE_DISTRIBUTION_DELAY_MS,
            idempotency_ttl_ms: DEFAULT_IDEMPOTENCY_TTL_MS,
            idempotency_body_limit_bytes: DEFAULT_IDEMPOTENCY_BODY_LIMIT_BYTES,
            registration_window_ms: DEFAULT_REGISTRATION_WINDOW_MS,
            registration_max_attempts: DEFAULT_REGISTRATION_MAX_ATTEMPTS,
            referral_window_ms: DEFAULT_REFERRAL_WINDOW_MS,
            referral_max_per_caller: DEFAULT_REFERRAL_MAX_PER_CALLER,
            referral_max_per_ip: DEFAULT_REFERRAL_MAX_PER_IP,
            referral_max_per_device: DEFAULT_REFERRAL_MAX_PER_DEVICE,
            referral_max_per_code: DEFAULT_REFERRAL_MAX_PER_CODE,
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            allowed_origins: Vec::new(),
            allow_no_origin: true,
            counters_redis_url: None,
            counters_redis_prefix: Some(DEFAULT_COUNTERS_REDIS_PREFIX.to_string()),
        }
    }
}

impl ArenaConfig {
    /// Configuration for tests and embedded use: no HTTP throttling, so
    /// requests without a peer address are accepted.
    pub fn unthrottled() -> Self {
        Self {
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            ..Self::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    pub fn registration_limit(&self) -> Limit {
        Limit::new(self.registration_window_ms, self.registration_max_attempts)
    }

    pub fn referral_caller_limit(&self) -> Limit {
        Limit::new(self.referral_window_ms, self.referral_max_per_caller)
    }

    pub fn referral_ip_limit(&self) -> Limit {
        Limit::new(self.referral_window_ms, self.referral_max_per_ip)
    }

    pub fn referral_device_limit(&self) -> Limit {
        Limit::new(self.referral_window_ms, self.referral_max_per_device)
    }

    pub fn referral_code_limit(&self) -> Limit {
        Limit::new(self.referral_window_ms, self.referral_max_per_code)
    }

    pub fn counters_redis_prefix(&self) -> String {
        self.counters_redis_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_COUNTERS_REDIS_PREFIX.to_string())
    }
}
