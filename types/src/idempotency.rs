use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{IDEMPOTENCY_KEY_MAX_LEN, IDEMPOTENCY_KEY_MIN_LEN};
use crate::error::{Error, Result};

/// A client supplied `X-Idempotency-Key`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim();
        if key.len() < IDEMPOTENCY_KEY_MIN_LEN || key.len() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(Error::Validation(format!(
                "idempotency key must be {IDEMPOTENCY_KEY_MIN_LEN}-{IDEMPOTENCY_KEY_MAX_LEN} characters"
            )));
        }
        if !key.bytes().all(|byte| byte.is_ascii_graphic()) {
            return Err(Error::Validation(
                "idempotency key must be printable ASCII".into(),
            ));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

/// Unique identity of a ledger entry. The same client key used by two
/// callers, or on two scopes, never collides.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub key: String,
    pub scope: String,
    pub caller: String,
}

impl RecordKey {
    pub fn new(key: &IdempotencyKey, scope: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            key: key.as_str().to_string(),
            scope: scope.into(),
            caller: caller.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: RecordKey,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Vec<u8>>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl IdempotencyRecord {
    pub fn processing(key: RecordKey, request_hash: String, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            key,
            request_hash,
            status: IdempotencyStatus::Processing,
            response_code: None,
            response_body: None,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    /// Final status for a captured response. Server errors and throttled
    /// attempts may be retried with the same key.
    pub fn outcome_status(response_code: u16) -> IdempotencyStatus {
        if response_code >= 500 || response_code == 429 {
            IdempotencyStatus::Failed
        } else {
            IdempotencyStatus::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_bounds() {
        assert!(IdempotencyKey::parse("short").is_err());
        assert!(IdempotencyKey::parse("abcdefgh").is_ok());
        assert!(IdempotencyKey::parse(&"k".repeat(128)).is_ok());
        assert!(IdempotencyKey::parse(&"k".repeat(129)).is_err());
        assert!(IdempotencyKey::parse("has space inside").is_err());
        assert_eq!(
            IdempotencyKey::parse("  padded-key  ").unwrap().as_str(),
            "padded-key"
        );
    }

    #[test]
    fn expiry_and_outcome() {
        let key = IdempotencyKey::parse("request-0001").unwrap();
        let record = IdempotencyRecord::processing(RecordKey::new(&key, "s", "u"), "h".into(), 10, 5);
        assert!(!record.is_expired(14));
        assert!(record.is_expired(15));
        assert_eq!(IdempotencyRecord::outcome_status(400), IdempotencyStatus::Completed);
        assert_eq!(IdempotencyRecord::outcome_status(503), IdempotencyStatus::Failed);
        assert_eq!(IdempotencyRecord::outcome_status(429), IdempotencyStatus::Failed);
    }
}
