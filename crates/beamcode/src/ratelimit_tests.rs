// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use super::*;

fn config() -> RateLimiterConfig {
    RateLimiterConfig {
        capacity: 5.0,
        refill_interval: Duration::from_millis(20),
        tokens_per_interval: 5.0,
    }
}

#[tokio::test]
async fn consumes_up_to_capacity_then_rejects() {
    let limiter = RateLimiter::new(config());
    for _ in 0..5 {
        assert!(limiter.try_consume(1.0).await);
    }
    assert!(!limiter.try_consume(1.0).await);
}

#[tokio::test]
async fn never_allows_consuming_more_than_available() {
    let limiter = RateLimiter::new(config());
    assert!(!limiter.try_consume(6.0).await);
    assert!(limiter.try_consume(5.0).await);
}

#[tokio::test]
async fn refills_over_time() {
    let limiter = RateLimiter::new(config());
    assert!(limiter.try_consume(5.0).await);
    assert!(!limiter.try_consume(1.0).await);

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(limiter.try_consume(1.0).await);
}

#[tokio::test]
async fn reset_restores_full_capacity() {
    let limiter = RateLimiter::new(config());
    limiter.try_consume(5.0).await;
    limiter.reset().await;
    assert!(limiter.try_consume(5.0).await);
}
