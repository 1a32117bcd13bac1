//! Idempotency ledger.
//!
//! A side-effecting handler runs at most once per `(key, scope, caller)`.
//! The first request claims a `processing` record; the captured response is
//! stored when the handler returns and replayed verbatim to later requests
//! with the same fingerprint until the record expires.

use bytes::Bytes;
use commonware_cryptography::{Hasher, Sha256};
use gauntlet_types::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, RecordKey};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::store::{Claim, IdempotencyStore, StoreError};

/// Status and body of a handler response, as stored by the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedResponse {
    pub status: u16,
    pub body: Bytes,
}

impl CapturedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The handler ran for this request.
    Executed(CapturedResponse),
    /// A stored response from an earlier request.
    Replayed(CapturedResponse),
}

impl LedgerOutcome {
    pub fn is_replay(&self) -> bool {
        matches!(self, LedgerOutcome::Replayed(_))
    }

    pub fn into_response(self) -> CapturedResponse {
        match self {
            LedgerOutcome::Executed(response) | LedgerOutcome::Replayed(response) => response,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("request with this idempotency key is already processing")]
    InFlight,
    #[error("idempotency key reused with a different payload")]
    KeyReuse,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Status recorded for a request whose handler was dropped mid-flight.
const ABANDONED_STATUS: u16 = 499;

/// Releases a claimed record as `failed` when the handler future is dropped
/// before its response is stored, e.g. on client disconnect. The same key can
/// then be retried instead of waiting out the TTL.
struct ClaimGuard {
    store: Arc<dyn IdempotencyStore>,
    key: Option<RecordKey>,
    expires_at: u64,
}

impl ClaimGuard {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        tracing::warn!(key = %key.key, scope = %key.scope, caller = %key.caller, "request abandoned mid-flight");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(key = %key.key, "no runtime to release abandoned idempotency record");
            return;
        };
        let store = self.store.clone();
        let expires_at = self.expires_at;
        handle.spawn(async move {
            if let Err(err) = store
                .finish(&key, IdempotencyStatus::Failed, ABANDONED_STATUS, Vec::new(), expires_at)
                .await
            {
                tracing::warn!(key = %key.key, ?err, "failed to release abandoned idempotency record");
            }
        });
    }
}

pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    ttl_ms: u64,
    body_limit: usize,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl_ms: u64, body_limit: usize) -> Self {
        Self {
            store,
            ttl_ms,
            body_limit,
        }
    }

    pub async fn execute<F, Fut>(
        &self,
        key: &IdempotencyKey,
        scope: &str,
        caller: &str,
        fingerprint: &str,
        now_ms: u64,
        handler: F,
    ) -> Result<LedgerOutcome, LedgerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CapturedResponse>,
    {
        let record_key = RecordKey::new(key, scope, caller);
        let record =
            IdempotencyRecord::processing(record_key.clone(), fingerprint.to_string(), now_ms, self.ttl_ms);

        match self.store.claim(record, now_ms).await? {
            Claim::Claimed => {}
            Claim::Existing(existing) => {
                if existing.request_hash != fingerprint {
                    return Err(LedgerError::KeyReuse);
                }
                match existing.status {
                    IdempotencyStatus::Completed => {
                        tracing::debug!(key = %key, scope, caller, "replaying stored response");
                        return Ok(LedgerOutcome::Replayed(CapturedResponse {
                            status: existing.response_code.unwrap_or(200),
                            body: Bytes::from(existing.response_body.unwrap_or_default()),
                        }));
                    }
                    IdempotencyStatus::Processing => return Err(LedgerError::InFlight),
                    IdempotencyStatus::Failed => {
                        let reclaimed = self
                            .store
                            .reclaim_failed(&record_key, fingerprint, now_ms, self.ttl_ms)
                            .await?;
                        if !reclaimed {
                            return Err(LedgerError::InFlight);
                        }
                        tracing::info!(key = %key, scope, caller, "retrying failed request");
                    }
                }
            }
        }

        let mut guard = ClaimGuard {
            store: self.store.clone(),
            key: Some(record_key.clone()),
            expires_at: now_ms.saturating_add(self.ttl_ms),
        };
        let response = handler().await;
        guard.disarm();
        let mut stored = response.body.to_vec();
        stored.truncate(self.body_limit);
        let status = IdempotencyRecord::outcome_status(response.status);
        let expires_at = crate::now_ms().max(now_ms).saturating_add(self.ttl_ms);
        if let Err(err) = self
            .store
            .finish(&record_key, status, response.status, stored, expires_at)
            .await
        {
            // The record stays `processing` until it expires.
            tracing::warn!(key = %key, scope, caller, ?err, "failed to store idempotent response");
        }
        Ok(LedgerOutcome::Executed(response))
    }

    pub async fn purge(&self, now_ms: u64) -> Result<usize, StoreError> {
        self.store.purge_expired(now_ms).await
    }
}

/// Hex SHA-256 of the canonical JSON document `{body, params, query}`.
pub fn fingerprint(body: &Value, query: &Value, params: &Value) -> String {
    let mut canonical = String::new();
    canonical.push_str("{\"body\":");
    write_canonical(body, &mut canonical);
    canonical.push_str(",\"params\":");
    write_canonical(params, &mut canonical);
    canonical.push_str(",\"query\":");
    write_canonical(query, &mut canonical);
    canonical.push('}');
    let digest = Sha256::hash(canonical.as_bytes());
    commonware_utils::hex(digest.as_ref())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ledger() -> IdempotencyLedger {
        IdempotencyLedger::new(Arc::new(MemoryStore::default()), 60_000, 16)
    }

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn replays_completed_response() {
        let ledger = ledger();
        let calls = &AtomicUsize::new(0);
        let run = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            CapturedResponse::new(201, "created")
        };
        let first = ledger
            .execute(&key("key-00001"), "register:t1", "u1", "h1", 1_000, run)
            .await
            .unwrap();
        assert!(!first.is_replay());
        let second = ledger
            .execute(&key("key-00001"), "register:t1", "u1", "h1", 2_000, run)
            .await
            .unwrap();
        assert!(second.is_replay());
        assert_eq!(second.into_response(), CapturedResponse::new(201, "created"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Another caller with the same key is independent.
        let other = ledger
            .execute(&key("key-00001"), "register:t1", "u2", "h1", 2_000, run)
            .await
            .unwrap();
        assert!(!other.is_replay());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn key_reuse_with_different_payload_conflicts() {
        let ledger = ledger();
        let calls = &AtomicUsize::new(0);
        let run = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            CapturedResponse::new(201, "ok")
        };
        ledger
            .execute(&key("key-00002"), "s", "u1", "h1", 0, run)
            .await
            .unwrap();
        let err = ledger
            .execute(&key("key-00002"), "s", "u1", "h2", 1, run)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::KeyReuse));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_response_allows_one_retry() {
        let ledger = ledger();
        let failed = ledger
            .execute(&key("key-00003"), "s", "u1", "h", 0, || async {
                CapturedResponse::new(500, "boom")
            })
            .await
            .unwrap();
        assert_eq!(failed.into_response().status, 500);

        let retried = ledger
            .execute(&key("key-00003"), "s", "u1", "h", 10, || async {
                CapturedResponse::new(201, "ok")
            })
            .await
            .unwrap();
        assert!(!retried.is_replay());

        let replayed = ledger
            .execute(&key("key-00003"), "s", "u1", "h", 20, || async {
                CapturedResponse::new(201, "again")
            })
            .await
            .unwrap();
        assert_eq!(replayed, LedgerOutcome::Replayed(CapturedResponse::new(201, "ok")));
    }

    #[tokio::test]
    async fn stored_body_is_truncated() {
        let ledger = ledger();
        let long = "x".repeat(64);
        let first = ledger
            .execute(&key("key-00004"), "s", "u1", "h", 0, move || async move {
                CapturedResponse::new(200, long)
            })
            .await
            .unwrap();
        assert_eq!(first.into_response().body.len(), 64);
        let replay = ledger
            .execute(&key("key-00004"), "s", "u1", "h", 1, || async {
                CapturedResponse::new(200, "")
            })
            .await
            .unwrap();
        assert_eq!(replay.into_response().body.len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_run_once() {
        let ledger = Arc::new(ledger());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .execute(&key("key-00005"), "s", "u1", "h", 0, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        CapturedResponse::new(201, "ok")
                    })
                    .await
            }));
        }
        let mut executed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(LedgerOutcome::Executed(_)) => executed += 1,
                Ok(LedgerOutcome::Replayed(_)) | Err(LedgerError::InFlight) => {}
                Err(other) => panic!("unexpected ledger error: {other}"),
            }
        }
        assert_eq!(executed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_handler_releases_its_claim() {
        let ledger = ledger();
        let slow_key = key("key-00006");
        let slow = ledger.execute(&slow_key, "s", "u1", "h", 0, || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            CapturedResponse::new(201, "late")
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());
        // The release is written by a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let retried = ledger
            .execute(&key("key-00006"), "s", "u1", "h", 30, || async {
                CapturedResponse::new(201, "ok")
            })
            .await
            .unwrap();
        assert_eq!(retried, LedgerOutcome::Executed(CapturedResponse::new(201, "ok")));
        let replayed = ledger
            .execute(&key("key-00006"), "s", "u1", "h", 40, || async {
                CapturedResponse::new(201, "again")
            })
            .await
            .unwrap();
        assert_eq!(replayed, LedgerOutcome::Replayed(CapturedResponse::new(201, "ok")));
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = fingerprint(
            &json!({"teamId": "red", "meta": {"b": 1, "a": [1, {"y": 2, "x": 1}]}}),
            &json!({}),
            &json!({"id": "t1"}),
        );
        let b = fingerprint(
            &json!({"meta": {"a": [1, {"x": 1, "y": 2}], "b": 1}, "teamId": "red"}),
            &json!({}),
            &json!({"id": "t1"}),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other = fingerprint(&json!({"teamId": "blue"}), &json!({}), &json!({"id": "t1"}));
        assert_ne!(a, other);
        // Array order is significant.
        assert_ne!(
            fingerprint(&json!([1, 2]), &json!({}), &json!({})),
            fingerprint(&json!([2, 1]), &json!({}), &json!({}))
        );
    }
}
