// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-consumer token-bucket rate limiter (spec.md §4.11).

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub capacity: f64,
    pub refill_interval: Duration,
    pub tokens_per_interval: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_interval: Duration::from_secs(1),
            tokens_per_interval: 10.0,
        }
    }
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

/// One instance per attached consumer (spec.md §3: `Consumer.rateLimiter`).
pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Mutex::new(Inner { tokens: config.capacity, last_refill: Instant::now() }),
            config,
        }
    }

    fn refill_locked(&self, inner: &mut Inner) {
        let elapsed = inner.last_refill.elapsed();
        if elapsed.is_zero() {
            return;
        }
        let intervals = elapsed.as_secs_f64() / self.config.refill_interval.as_secs_f64();
        let added = intervals * self.config.tokens_per_interval;
        if added > 0.0 {
            inner.tokens = (inner.tokens + added).min(self.config.capacity);
            inner.last_refill = Instant::now();
        }
    }

    /// Refill, then atomically subtract `n` tokens if available.
    pub async fn try_consume(&self, n: f64) -> bool {
        let mut inner = self.inner.lock().await;
        self.refill_locked(&mut inner);
        if inner.tokens >= n {
            inner.tokens -= n;
            true
        } else {
            false
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.tokens = self.config.capacity;
        inner.last_refill = Instant::now();
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
