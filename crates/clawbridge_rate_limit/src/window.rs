//! Sliding-window request log.

use crate::{RateLimitError, RateLimitErrorKind};
use chrono::{DateTime, Duration, Utc};
use clawbridge_core::Clock;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, instrument};

const DEFAULT_SHARDS: usize = 16;

type Shard = Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>;

/// Per-identity sliding-window limiter.
///
/// Each identity keeps a log of admitted request timestamps. A request is
/// admitted when the entries younger than the window, plus its cost, fit in the
/// limit. This guarantees that no rolling window ever admits more than the
/// limit, which a fixed window or token bucket cannot.
///
/// Identities are spread over independently locked shards so that concurrent
/// requests from different identities rarely contend.
#[derive(Debug, derive_getters::Getters)]
pub struct SlidingWindowLimiter {
    #[getter(skip)]
    shards: Vec<Shard>,
    /// Length of the window
    window: Duration,
    #[getter(skip)]
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Limiter with a 60-second window.
    pub fn per_minute(clock: Arc<dyn Clock>) -> Self {
        Self::new(Duration::seconds(60), clock)
    }

    /// Limiter with a custom window.
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..DEFAULT_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            window,
            clock,
        }
    }

    fn shard(&self, identity: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Admit `cost` requests for `identity` if the budget allows.
    ///
    /// Rejected requests are not recorded. Returns the instant the admission
    /// was logged at, which [`release`](Self::release) needs to undo it.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` when the window is full, or `CostExceedsLimit`
    /// when the request could never fit.
    #[instrument(skip(self), fields(window_secs = self.window.num_seconds()))]
    pub fn check(&self, identity: &str, limit: u32, cost: u32) -> Result<DateTime<Utc>, RateLimitError> {
        if cost > limit {
            return Err(RateLimitError::new(RateLimitErrorKind::CostExceedsLimit {
                identity: identity.to_string(),
                cost,
                limit,
            }));
        }

        let now = self.clock.now();
        let cutoff = now - self.window;
        let mut shard = self.shard(identity).lock();
        let log = shard.entry(identity.to_string()).or_default();
        while log.front().is_some_and(|t| *t <= cutoff) {
            log.pop_front();
        }

        let used = log.len();
        let cost = cost as usize;
        let limit_usize = limit as usize;
        if used + cost > limit_usize {
            // The entry whose expiry frees enough room for this request.
            let freeing = used + cost - limit_usize - 1;
            let retry_after = log
                .get(freeing)
                .map(|t| (*t + self.window - now).num_seconds().max(1) as u64)
                .unwrap_or(self.window.num_seconds() as u64);
            debug!(used, limit, retry_after, "Rate limit exceeded");
            return Err(RateLimitError::new(RateLimitErrorKind::LimitExceeded {
                identity: identity.to_string(),
                limit,
                retry_after_secs: retry_after,
            }));
        }

        log.extend(std::iter::repeat_n(now, cost));
        debug!(used = used + cost, limit, "Request admitted");
        Ok(now)
    }

    /// Boolean form of [`check`](Self::check).
    pub fn allow(&self, identity: &str, limit: u32, cost: u32) -> bool {
        self.check(identity, limit, cost).is_ok()
    }

    /// Return `cost` most recent admissions recorded at `at`.
    ///
    /// Used to undo an admission when a second limiter rejects the same request.
    pub fn release(&self, identity: &str, at: DateTime<Utc>, cost: u32) {
        let mut shard = self.shard(identity).lock();
        let Some(log) = shard.get_mut(identity) else {
            return;
        };
        let mut remaining = cost;
        let mut index = log.len();
        while remaining > 0 && index > 0 {
            index -= 1;
            if log[index] == at {
                log.remove(index);
                remaining -= 1;
            } else if log[index] < at {
                break;
            }
        }
    }

    /// Requests still counted against `identity` right now.
    pub fn used(&self, identity: &str) -> usize {
        let cutoff = self.clock.now() - self.window;
        let shard = self.shard(identity).lock();
        shard
            .get(identity)
            .map(|log| log.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }

    /// Drop identities whose log has fully expired. Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        let cutoff = self.clock.now() - self.window;
        let mut dropped = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, log| log.back().is_some_and(|t| *t > cutoff));
            dropped += before - shard.len();
        }
        dropped
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Current instant according to the limiter's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawbridge_core::ManualClock;

    fn limiter() -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = SlidingWindowLimiter::per_minute(clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_cost_above_limit_never_fits() {
        let (_, limiter) = limiter();
        let err = limiter.check("10.0.0.1", 2, 3).unwrap_err();
        assert!(matches!(err.kind(), RateLimitErrorKind::CostExceedsLimit { .. }));
    }

    #[test]
    fn test_retry_after_points_at_oldest_entry() {
        let (clock, limiter) = limiter();
        assert!(limiter.allow("a", 1, 1));
        clock.advance(Duration::seconds(20));
        let err = limiter.check("a", 1, 1).unwrap_err();
        match err.kind() {
            RateLimitErrorKind::LimitExceeded {
                retry_after_secs, ..
            } => assert_eq!(*retry_after_secs, 40),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_release_undoes_admission() {
        let (_, limiter) = limiter();
        let at = limiter.check("a", 1, 1).unwrap();
        limiter.release("a", at, 1);
        assert_eq!(limiter.used("a"), 0);
        assert!(limiter.allow("a", 1, 1));
    }

    #[test]
    fn test_prune_idle() {
        let (clock, limiter) = limiter();
        assert!(limiter.allow("a", 5, 1));
        assert!(limiter.allow("b", 5, 1));
        clock.advance(Duration::seconds(61));
        assert_eq!(limiter.prune_idle(), 2);
        assert_eq!(limiter.tracked(), 0);
    }
}
