// ===============================
// src/breaker.rs
// ===============================
//
// Circuit breaker untuk execution API:
// - CLOSED : call lewat.
// - OPEN   : call langsung gagal tanpa network I/O sampai wall-clock >= open_until.
// - Sukses -> counter reset ke 0.
// - Gagal  -> counter +1; begitu counter >= threshold, open_until = now + backoff.
//
// State pakai atomics supaya bisa dibagi ke fan-out quote tanpa lock.
//
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until_ms: i64 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    open_until_ms: AtomicI64,
    threshold: u32,
    backoff: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, backoff: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicI64::new(0),
            threshold: threshold.max(1),
            backoff,
        }
    }

    pub fn state(&self, now_ms: i64) -> BreakerState {
        let until_ms = self.open_until_ms.load(Ordering::Acquire);
        if now_ms < until_ms {
            BreakerState::Open { until_ms }
        } else {
            BreakerState::Closed
        }
    }

    #[cfg(test)]
    pub fn allows(&self, now_ms: i64) -> bool {
        self.state(now_ms) == BreakerState::Closed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn record_success(&self) {
        let prev = self.consecutive_failures.swap(0, Ordering::AcqRel);
        if prev >= self.threshold {
            info!(prev_failures = prev, "circuit breaker closed - upstream recovered");
        }
    }

    /// Return true kalau failure ini membuat breaker open.
    pub fn record_failure(&self, now_ms: i64) -> bool {
        let n = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if n >= self.threshold {
            let until = now_ms + self.backoff.as_millis() as i64;
            self.open_until_ms.store(until, Ordering::Release);
            if n == self.threshold {
                error!(
                    failures = n,
                    backoff_secs = self.backoff.as_secs(),
                    "circuit breaker opened - pausing execution API calls"
                );
            }
            true
        } else {
            warn!(failures = n, threshold = self.threshold, "execution API failure");
            false
        }
    }
}
