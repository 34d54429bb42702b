//! Dual IP / API-key request limiter.

use crate::{RateLimitError, SlidingWindowLimiter};
use clawbridge_core::{ClientIdentity, Clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, instrument};

/// Applies the two request budgets a service call is subject to.
///
/// The source-IP budget (global default) always applies. The API-key budget
/// applies only when the request authenticated with a key that defines its own
/// limit. A request must fit both, so the stricter budget governs.
#[derive(Debug)]
pub struct RequestLimiter {
    by_ip: SlidingWindowLimiter,
    by_key: SlidingWindowLimiter,
    default_limit: AtomicU32,
}

impl RequestLimiter {
    /// Limiter with per-minute windows and the given global default.
    pub fn new(default_limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            by_ip: SlidingWindowLimiter::per_minute(clock.clone()),
            by_key: SlidingWindowLimiter::per_minute(clock),
            default_limit: AtomicU32::new(default_limit),
        }
    }

    /// Current global default budget.
    pub fn default_limit(&self) -> u32 {
        self.default_limit.load(Ordering::Relaxed)
    }

    /// Change the global default budget.
    pub fn set_default_limit(&self, limit: u32) {
        self.default_limit.store(limit, Ordering::Relaxed);
    }

    /// Admit one request of `cost` for the identity, or say why not.
    ///
    /// # Errors
    ///
    /// Returns the error of whichever budget rejected the request.
    #[instrument(skip(self, identity), fields(identity = %identity.label()))]
    pub fn check(&self, identity: &ClientIdentity, cost: u32) -> Result<(), RateLimitError> {
        let key_budget = match (identity.key_id(), identity.rate_limit_per_minute()) {
            (Some(key_id), Some(limit)) => Some((key_id.as_str(), *limit)),
            _ => None,
        };

        let admitted = match key_budget {
            Some((key_id, limit)) => Some((key_id, self.by_key.check(key_id, limit, cost)?)),
            None => None,
        };

        let ip = identity.source_ip().to_string();
        if let Err(err) = self.by_ip.check(&ip, self.default_limit(), cost) {
            if let Some((key_id, at)) = admitted {
                self.by_key.release(key_id, at, cost);
                debug!(key_id, "Key admission refunded after IP rejection");
            }
            return Err(err);
        }

        debug!("Request within budget");
        Ok(())
    }

    /// Boolean form of [`check`](Self::check).
    pub fn allow(&self, identity: &ClientIdentity, cost: u32) -> bool {
        self.check(identity, cost).is_ok()
    }

    /// Drop expired per-identity state from both limiters.
    pub fn prune_idle(&self) -> usize {
        self.by_ip.prune_idle() + self.by_key.prune_idle()
    }
}
