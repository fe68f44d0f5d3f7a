//! Per-key rate limiting: a fresh limiter instance the first time a key is
//! seen, reused for every subsequent request with that key.

use super::RateLimiter;
use crate::error::RateLimiterError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Lazily creates and caches one [`RateLimiter`] per key.
///
/// The factory is called at most once per distinct key; after that, all
/// requests for that key share the same limiter instance (and therefore the
/// same budget).
pub struct KeyedRateLimiter<K, F> {
    factory: F,
    limiters: Mutex<HashMap<K, Arc<dyn RateLimiter>>>,
}

impl<K, F> KeyedRateLimiter<K, F>
where
    K: Eq + Hash + Clone,
    F: Fn() -> Arc<dyn RateLimiter>,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    fn limiter_for(&self, key: &K) -> Arc<dyn RateLimiter> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(key.clone())
            .or_insert_with(|| (self.factory)())
            .clone()
    }

    /// Admits `permits` under `key`'s limiter, creating it first if this is
    /// the first time `key` is seen.
    pub async fn acquire(
        &self,
        key: &K,
        permits: u32,
        timeout: Duration,
    ) -> Result<(), RateLimiterError<Infallible>> {
        self.limiter_for(key).acquire(permits, timeout).await
    }

    /// Non-blocking probe under `key`'s limiter.
    pub fn try_acquire(&self, key: &K, permits: u32) -> Result<(), RateLimiterError<Infallible>> {
        self.limiter_for(key).try_acquire(permits)
    }

    /// Number of distinct keys with a limiter created so far.
    pub fn tracked_keys(&self) -> usize {
        self.limiters.lock().len()
    }

    /// Drops the cached limiter for `key`, if any. The next request for
    /// that key starts with a fresh limiter from the factory.
    pub fn forget(&self, key: &K) {
        self.limiters.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::TokenBucket;

    fn bucket() -> Arc<dyn RateLimiter> {
        Arc::new(TokenBucket::new(1, 1, Duration::from_secs(60), 0).unwrap())
    }

    #[tokio::test]
    async fn separate_keys_get_independent_budgets() {
        let limiter = KeyedRateLimiter::new(bucket);
        limiter.acquire(&"a", 1, Duration::ZERO).await.unwrap();
        assert!(limiter.acquire(&"a", 1, Duration::ZERO).await.is_err());
        // A different key has its own, untouched bucket.
        limiter.acquire(&"b", 1, Duration::ZERO).await.unwrap();
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn forget_resets_a_keys_limiter() {
        let limiter = KeyedRateLimiter::new(bucket);
        limiter.acquire(&"a", 1, Duration::ZERO).await.unwrap();
        assert!(limiter.acquire(&"a", 1, Duration::ZERO).await.is_err());
        limiter.forget(&"a");
        limiter.acquire(&"a", 1, Duration::ZERO).await.unwrap();
    }
}
