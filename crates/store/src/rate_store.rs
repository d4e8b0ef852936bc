//! Rate Limit Store (§4.11).
//!
//! Fixed-window counter keyed by source. `increment_and_check` rolls the
//! window forward and increments atomically; any store error the caller
//! observes must be treated as a limit breach (fail-closed, §4.11, §9).

use async_trait::async_trait;
use bouncer_model::RateCounter;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateStoreError {
    #[error("store io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment the counter for `source`, resetting the window if it has
    /// elapsed. Returns `true` if the count after incrementing is within
    /// `limit`, `false` if the source is rate-limited.
    async fn increment_and_check(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<bool, RateStoreError>;
}

#[async_trait]
impl RateLimitStore for std::sync::Arc<dyn RateLimitStore> {
    async fn increment_and_check(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<bool, RateStoreError> {
        self.as_ref().increment_and_check(source, now, window, limit).await
    }
}

#[derive(Default)]
pub struct InMemoryRateLimitStore {
    counters: Mutex<HashMap<String, RateCounter>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn increment_and_check(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<bool, RateStoreError> {
        let mut guard = self.counters.lock().unwrap();
        let counter = guard
            .entry(source.to_string())
            .or_insert_with(|| RateCounter {
                source: source.to_string(),
                window_start: now,
                count: 0,
            });
        if now - counter.window_start >= window {
            counter.window_start = now;
            counter.count = 0;
        }
        counter.count += 1;
        Ok(counter.count <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn blocks_after_limit_within_window() {
        let store = InMemoryRateLimitStore::new();
        let window = Duration::seconds(60);
        assert!(store
            .increment_and_check("bot-a", t(0), window, 2)
            .await
            .unwrap());
        assert!(store
            .increment_and_check("bot-a", t(1), window, 2)
            .await
            .unwrap());
        assert!(!store
            .increment_and_check("bot-a", t(2), window, 2)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn window_rolls_forward() {
        let store = InMemoryRateLimitStore::new();
        let window = Duration::seconds(60);
        store.increment_and_check("bot-a", t(0), window, 1).await.unwrap();
        assert!(!store
            .increment_and_check("bot-a", t(30), window, 1)
            .await
            .unwrap());
        assert!(store
            .increment_and_check("bot-a", t(61), window, 1)
            .await
            .unwrap());
    }
}
