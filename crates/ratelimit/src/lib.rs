//! bouncer_ratelimit
//!
//! Per-source admission rate limiting (§4.11). A thin wrapper over
//! `RateLimitStore` that commits to the fail-closed rule: a store error is
//! indistinguishable from a limit breach as far as the pipeline is
//! concerned (§9 "fail closed on exception").

use bouncer_store::{RateLimitStore, RateStoreError};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Store(#[from] RateStoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub limit: u64,
}

pub struct RateLimiter<S: RateLimitStore> {
    store: S,
    config: RateLimitConfig,
}

impl<S: RateLimitStore> RateLimiter<S> {
    pub fn new(store: S, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Returns `true` if `source` is within its window limit, `false` if
    /// rate-limited or the store itself errored.
    pub async fn admit(&self, source: &str, now: DateTime<Utc>) -> bool {
        self.store
            .increment_and_check(source, now, self.config.window, self.config.limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(source = %source, error = %e, "rate limit store errored, failing closed");
                false
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouncer_store::InMemoryRateLimitStore;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn admits_until_limit_then_refuses() {
        let limiter = RateLimiter::new(
            InMemoryRateLimitStore::new(),
            RateLimitConfig {
                window: Duration::seconds(60),
                limit: 2,
            },
        );
        assert!(limiter.admit("bot-a", t(0)).await);
        assert!(limiter.admit("bot-a", t(1)).await);
        assert!(!limiter.admit("bot-a", t(2)).await);
    }

    #[tokio::test]
    async fn sources_are_independent() {
        let limiter = RateLimiter::new(
            InMemoryRateLimitStore::new(),
            RateLimitConfig {
                window: Duration::seconds(60),
                limit: 1,
            },
        );
        assert!(limiter.admit("bot-a", t(0)).await);
        assert!(limiter.admit("bot-b", t(0)).await);
    }
}
