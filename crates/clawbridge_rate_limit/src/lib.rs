//! Rate limiting for the ClawBridge gateway.
//!
//! Budgets are enforced with a per-identity sliding window: any rolling window
//! admits at most the configured number of requests. Two independent limiters
//! run side by side, one keyed by source address and one by API key.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod limiter;
mod window;

pub use error::{RateLimitError, RateLimitErrorKind};
pub use limiter::RequestLimiter;
pub use window::SlidingWindowLimiter;
