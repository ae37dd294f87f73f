// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sliding-window circuit breaker (spec.md §4.3). Gates restart attempts
//! after repeated fast process failures; used by the Process Supervisor and
//! consulted by the Recovery Service.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub recovery_time: Duration,
    pub success_threshold: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_time: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Point-in-time snapshot suitable for embedding in `process:exited` events
/// (spec.md §4.2: "circuitBreaker snapshot is included only when the
/// breaker is not CLOSED").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: usize,
}

struct Inner {
    state: BreakerState,
    failures_in_window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
    half_open_in_flight: bool,
}

/// Thread-safe at its API boundary (spec.md §5): every method takes `&self`
/// and serializes through an internal mutex, matching the teacher's
/// `RwLock`-guarded registries.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures_in_window: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                half_open_in_flight: false,
            }),
        }
    }

    /// Whether a restart attempt may proceed right now. In `half_open`,
    /// returning `true` reserves the single in-flight execution slot; the
    /// caller must eventually call `record_success`/`record_failure`.
    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let Some(opened_at) = inner.opened_at else { return true };
                if opened_at.elapsed() >= self.config.recovery_time {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight {
                    false
                } else {
                    inner.half_open_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failures_in_window.clear();
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures_in_window.clear();
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => {
                inner.failures_in_window.push_back(now);
                let window = self.config.window;
                while let Some(front) = inner.failures_in_window.front() {
                    if now.duration_since(*front) > window {
                        inner.failures_in_window.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures_in_window.len() > self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = false;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.failures_in_window.clear();
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> Option<BreakerSnapshot> {
        let inner = self.inner.lock().await;
        if inner.state == BreakerState::Closed {
            None
        } else {
            Some(BreakerSnapshot {
                state: inner.state,
                failure_count: inner.failures_in_window.len(),
            })
        }
    }
}

#[cfg(test)]
#[path = "circuit_tests.rs"]
mod tests;
