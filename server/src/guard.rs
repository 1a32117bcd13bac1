//! Fraud and rate guard.
//!
//! Every actor (caller, IP, device, referral code, registration pair) gets an
//! independent sliding window in the configured [CounterBackend]. The guard
//! throttles; it is not an authorization boundary.

use axum::http::HeaderMap;
use commonware_cryptography::{Hasher, Sha256};
use gauntlet_types::constants::{REFERRAL_CODE_MAX_LEN, REFERRAL_CODE_MIN_LEN};
use gauntlet_types::{Error, Result};
use std::sync::Arc;

use crate::counters::{CounterBackend, Decision};

/// Headers folded into the device fingerprint.
const DEVICE_HEADERS: [&str; 6] = [
    "user-agent",
    "accept-language",
    "accept-encoding",
    "accept",
    "sec-ch-ua",
    "sec-ch-ua-platform",
];

/// `max_attempts` per trailing `window_ms`. A zero in either field disables
/// the limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    pub window_ms: u64,
    pub max_attempts: u32,
}

impl Limit {
    pub const fn new(window_ms: u64, max_attempts: u32) -> Self {
        Self {
            window_ms,
            max_attempts,
        }
    }

    fn is_disabled(&self) -> bool {
        self.window_ms == 0 || self.max_attempts == 0
    }
}

pub struct RateGuard {
    backend: Arc<dyn CounterBackend>,
}

impl RateGuard {
    pub fn new(backend: Arc<dyn CounterBackend>) -> Self {
        Self { backend }
    }

    pub async fn check(&self, actor_key: &str, limit: Limit, now_ms: u64) -> Result<()> {
        if limit.is_disabled() {
            return Ok(());
        }
        match self
            .backend
            .hit(actor_key, now_ms, limit.window_ms, limit.max_attempts)
            .await
        {
            Decision::Allow => Ok(()),
            Decision::Reject { retry_after_ms } => {
                tracing::info!(actor_key, retry_after_ms, "guard rejected attempt");
                Err(Error::RateLimited { retry_after_ms })
            }
        }
    }

    pub async fn sweep(&self, now_ms: u64) -> usize {
        self.backend.sweep(now_ms).await
    }
}

pub fn registration_key(user_id: &str, tournament_id: &str) -> String {
    format!("register:{tournament_id}:{user_id}")
}

/// Weak, stable identifier for the client software behind a request. Two
/// browsers with identical headers collide; that is acceptable for throttling.
pub fn device_fingerprint(headers: &HeaderMap) -> String {
    let mut material = String::new();
    for name in DEVICE_HEADERS {
        let value = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        material.push_str(value);
        material.push('\u{1f}');
    }
    let digest = Sha256::hash(material.as_bytes());
    let mut hex = commonware_utils::hex(digest.as_ref());
    hex.truncate(16);
    hex
}

/// Normalizes and validates a referral code: 6 to 8 uppercase alphanumerics.
pub fn normalize_referral_code(raw: &str) -> Result<String> {
    let code = raw.trim().to_ascii_uppercase();
    let valid_len = (REFERRAL_CODE_MIN_LEN..=REFERRAL_CODE_MAX_LEN).contains(&code.len());
    if !valid_len || !code.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
        return Err(Error::Validation(format!(
            "referral code must be {REFERRAL_CODE_MIN_LEN}-{REFERRAL_CODE_MAX_LEN} letters or digits"
        )));
    }
    Ok(code)
}
