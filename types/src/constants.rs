pub const SECOND_MS: u64 = 1_000;
pub const MINUTE_MS: u64 = 60 * SECOND_MS;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Shortest idempotency key a caller may supply.
pub const IDEMPOTENCY_KEY_MIN_LEN: usize = 8;

/// Longest idempotency key a caller may supply.
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 128;

/// Lifetime of an idempotency record, whatever its outcome.
pub const DEFAULT_IDEMPOTENCY_TTL_MS: u64 = HOUR_MS;

/// Captured response bodies are truncated to this many bytes.
pub const DEFAULT_IDEMPOTENCY_BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Delay between tournament completion and prize payout.
pub const PRIZE_DISTRIBUTION_DELAY_MS: u64 = 48 * HOUR_MS;

/// Room credentials become visible this long before a match starts.
pub const ROOM_REVEAL_LEAD_MS: u64 = 5 * MINUTE_MS;

/// Room credentials stay valid this long after a match starts.
pub const ROOM_CREDENTIAL_TTL_MS: u64 = 6 * HOUR_MS;

/// Matches still open this long after their start are force-completed.
pub const STALE_MATCH_AFTER_MS: u64 = 6 * HOUR_MS;

/// Gap between consecutive first-round matches.
pub const DEFAULT_MATCH_SPACING_MS: u64 = 30 * MINUTE_MS;

/// Lifecycle sweep period.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5 * MINUTE_MS;

/// Prize split for positions 1, 2 and 3 in basis points.
pub const PRIZE_SPLIT_BPS: [u64; 3] = [5_000, 3_000, 2_000];
pub const BPS_DENOMINATOR: u64 = 10_000;

pub const REFERRAL_CODE_MIN_LEN: usize = 6;
pub const REFERRAL_CODE_MAX_LEN: usize = 8;
