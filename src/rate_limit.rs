use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// key: rate-limiter -> check(identifier, operation)
pub trait RateLimiter: Send + Sync {
    fn check(&self, identifier: &str, operation: &str) -> RateDecision;
}

/// In-process sliding window: at most `limit` hits per `window` for each
/// `(identifier, operation)`.
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    hits: DashMap<(String, String), VecDeque<Instant>>,
    checks: AtomicUsize,
}

/// Checks between sweeps of idle keys.
const PRUNE_EVERY: usize = 256;

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            hits: DashMap::new(),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            *config::RATE_LIMIT_SUBMISSIONS,
            Duration::from_secs(*config::RATE_LIMIT_WINDOW_SECS),
        )
    }

    fn check_at(&self, identifier: &str, operation: &str, now: Instant) -> RateDecision {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }
        let mut entry = self
            .hits
            .entry((identifier.to_string(), operation.to_string()))
            .or_default();
        let hits = entry.value_mut();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.limit {
            let retry_after = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return RateDecision::Limited { retry_after };
        }
        hits.push_back(now);
        RateDecision::Allowed
    }

    /// Drop keys whose hits have all left the window.
    fn prune(&self, now: Instant) {
        self.hits.retain(|_, hits| {
            hits.back()
                .map_or(false, |last| now.duration_since(*last) < self.window)
        });
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, identifier: &str, operation: &str) -> RateDecision {
        self.check_at(identifier, operation, Instant::now())
    }
}
