//! Circuit-breaker policy for upstream calls.
//!
//! One breaker per upstream (market data, chat send). Closed counts
//! consecutive failures; crossing the threshold opens the circuit for
//! `open_duration`, after which a single half-open probe decides whether
//! to close again.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: &'static str,
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl BreakerConfig {
    pub fn new(name: &'static str, failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            open_duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

/// Observable counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
}

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
                consecutive_failures: 0,
                opened_at: None,
                total_successes: 0,
                total_failures: 0,
                times_opened: 0,
            }),
        }
    }

    /// Whether a call may proceed. An open circuit transitions to half-open
    /// after `open_duration` and admits exactly one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    info!(breaker = self.config.name, "circuit half-open, probing upstream");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            info!(breaker = self.config.name, "circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };

        if should_open {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.times_opened += 1;
            warn!(
                breaker = self.config.name,
                failures = inner.consecutive_failures,
                "🛑 circuit opened"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == BreakerState::Closed
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.config.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            times_opened: inner.times_opened,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::new("test", 3, Duration::from_millis(open_ms)))
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker(60_000);
        assert!(b.allow());
        b.record_failure();
        b.record_failure();
        assert!(b.allow());
        b.record_failure();
        assert!(!b.allow());
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert_eq!(b.snapshot().times_opened, 1);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let b = breaker(60_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert!(b.allow());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let b = breaker(0);
        for _ in 0..3 {
            b.record_failure();
        }
        // open_duration elapsed immediately; first allow() is the probe.
        assert!(b.allow());
        assert_eq!(b.snapshot().state, BreakerState::HalfOpen);
        // Concurrent callers are rejected while probing.
        assert!(!b.allow());

        b.record_success();
        assert!(b.allow());
        assert_eq!(b.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let b = breaker(0);
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert_eq!(b.snapshot().times_opened, 2);
    }
}
