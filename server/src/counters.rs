//! Sliding-window attempt counters.
//!
//! Counters are best-effort: a backend that cannot reach its storage lets the
//! attempt through and logs, it never blocks legitimate traffic.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Result of recording one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject { retry_after_ms: u64 },
}

#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Records an attempt for `key` at `now_ms` unless `max_attempts` attempts
    /// already fall within the trailing `window_ms`.
    async fn hit(&self, key: &str, now_ms: u64, window_ms: u64, max_attempts: u32) -> Decision;

    /// Drops state older than twice its window. Returns the number of keys evicted.
    async fn sweep(&self, now_ms: u64) -> usize;
}

struct Window {
    window_ms: u64,
    hits: VecDeque<u64>,
}

impl Window {
    fn prune(&mut self, now_ms: u64) {
        while let Some(&front) = self.hits.front() {
            if front.saturating_add(self.window_ms) <= now_ms {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-local counters. State is lost on restart and not shared between
/// instances.
#[derive(Default)]
pub struct InProcessCounters {
    windows: Mutex<HashMap<String, Window>>,
}

impl InProcessCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().map(|windows| windows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterBackend for InProcessCounters {
    async fn hit(&self, key: &str, now_ms: u64, window_ms: u64, max_attempts: u32) -> Decision {
        let Ok(mut windows) = self.windows.lock() else {
            tracing::warn!(key, "counter map poisoned; allowing attempt");
            return Decision::Allow;
        };
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            window_ms,
            hits: VecDeque::new(),
        });
        window.window_ms = window_ms;
        window.prune(now_ms);

        if window.hits.len() >= max_attempts as usize {
            let oldest = window.hits.front().copied().unwrap_or(now_ms);
            let retry_after_ms = oldest.saturating_add(window_ms).saturating_sub(now_ms).max(1);
            return Decision::Reject { retry_after_ms };
        }
        window.hits.push_back(now_ms);
        Decision::Allow
    }

    async fn sweep(&self, now_ms: u64) -> usize {
        let Ok(mut windows) = self.windows.lock() else {
            return 0;
        };
        let before = windows.len();
        windows.retain(|_, window| {
            let last = window.hits.back().copied().unwrap_or(0);
            last.saturating_add(window.window_ms.saturating_mul(2)) > now_ms
        });
        before - windows.len()
    }
}

/// Counters kept in Redis sorted sets (score = attempt time), shared by every
/// instance pointing at the same server and prefix.
pub struct RedisCounters {
    client: redis::Client,
    connection: AsyncMutex<Option<redis::aio::ConnectionManager>>,
    prefix: String,
}

impl RedisCounters {
    pub fn new(url: &str, prefix: String) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: AsyncMutex::new(None),
            prefix,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn ensure_connection(
        &self,
    ) -> Result<
        tokio::sync::MutexGuard<'_, Option<redis::aio::ConnectionManager>>,
        redis::RedisError,
    > {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_connection_manager().await?);
        }
        Ok(guard)
    }
}

#[async_trait]
impl CounterBackend for RedisCounters {
    async fn hit(&self, key: &str, now_ms: u64, window_ms: u64, max_attempts: u32) -> Decision {
        let mut guard = match self.ensure_connection().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("Redis counter connection failed: {err}");
                return Decision::Allow;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return Decision::Allow;
        };
        let full_key = self.key(key);
        let cutoff = now_ms.saturating_sub(window_ms);

        let result: redis::RedisResult<(u64, Vec<(String, f64)>)> = redis::pipe()
            .atomic()
            .zrembyscore(&full_key, 0, cutoff)
            .ignore()
            .zcard(&full_key)
            .zrange_withscores(&full_key, 0, 0)
            .query_async(conn)
            .await;
        let (count, oldest) = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Redis counter read failed: {err}");
                *guard = None;
                return Decision::Allow;
            }
        };

        if count >= u64::from(max_attempts) {
            let oldest = oldest
                .first()
                .map(|(_, score)| *score as u64)
                .unwrap_or(now_ms);
            let retry_after_ms = oldest.saturating_add(window_ms).saturating_sub(now_ms).max(1);
            return Decision::Reject { retry_after_ms };
        }

        let member = format!("{now_ms}:{}", Uuid::new_v4());
        let ttl_ms = window_ms.saturating_mul(2).max(1) as i64;
        let written: redis::RedisResult<()> = async {
            conn.zadd::<_, _, _, ()>(&full_key, member, now_ms).await?;
            conn.pexpire::<_, ()>(&full_key, ttl_ms).await
        }
        .await;
        if let Err(err) = written {
            tracing::warn!("Redis counter write failed: {err}");
            *guard = None;
        }
        Decision::Allow
    }

    async fn sweep(&self, _now_ms: u64) -> usize {
        // Keys carry a PEXPIRE of twice their window; Redis evicts them.
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_once_window_is_full() {
        let counters = InProcessCounters::new();
        assert_eq!(counters.hit("k", 1_000, 100, 2).await, Decision::Allow);
        assert_eq!(counters.hit("k", 1_010, 100, 2).await, Decision::Allow);
        assert_eq!(
            counters.hit("k", 1_050, 100, 2).await,
            Decision::Reject { retry_after_ms: 50 }
        );
        // The first hit slides out of the window.
        assert_eq!(counters.hit("k", 1_100, 100, 2).await, Decision::Allow);
        // Other keys are independent.
        assert_eq!(counters.hit("other", 1_100, 100, 2).await, Decision::Allow);
    }

    #[tokio::test]
    async fn rejected_attempts_are_not_counted() {
        let counters = InProcessCounters::new();
        assert_eq!(counters.hit("k", 0, 100, 1).await, Decision::Allow);
        for now in 1..50 {
            assert!(matches!(
                counters.hit("k", now, 100, 1).await,
                Decision::Reject { .. }
            ));
        }
        assert_eq!(counters.hit("k", 100, 100, 1).await, Decision::Allow);
    }

    #[tokio::test]
    async fn sweep_evicts_after_twice_the_window() {
        let counters = InProcessCounters::new();
        counters.hit("a", 0, 100, 5).await;
        counters.hit("b", 150, 100, 5).await;
        assert_eq!(counters.sweep(199).await, 0);
        assert_eq!(counters.sweep(200).await, 1);
        assert_eq!(counters.len(), 1);
        assert_eq!(counters.sweep(350).await, 1);
        assert!(counters.is_empty());
    }
}
