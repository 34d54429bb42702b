//! Tests for the sliding-window and dual limiters.

use chrono::{Duration, Utc};
use clawbridge_core::{ClientIdentity, ManualClock, SystemClock};
use clawbridge_rate_limit::{RateLimitErrorKind, RequestLimiter, SlidingWindowLimiter};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40));

#[test]
fn test_n_plus_one_in_window_is_rejected() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = SlidingWindowLimiter::per_minute(clock.clone());

    for _ in 0..5 {
        assert!(limiter.allow("agent", 5, 1));
        clock.advance(Duration::seconds(10));
    }
    // Fifty seconds in, all five are still inside the window.
    let err = limiter.check("agent", 5, 1).unwrap_err();
    assert!(matches!(err.kind(), RateLimitErrorKind::LimitExceeded { .. }));
}

#[test]
fn test_rolling_window_never_admits_more_than_limit() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = SlidingWindowLimiter::per_minute(clock.clone());

    // Burst at the very end of one minute and the start of the next: a fixed
    // window would admit twice the limit here.
    clock.advance(Duration::seconds(59));
    for _ in 0..3 {
        assert!(limiter.allow("agent", 3, 1));
    }
    clock.advance(Duration::seconds(2));
    assert!(!limiter.allow("agent", 3, 1));
}

#[test]
fn test_requests_succeed_after_window_rolls() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = SlidingWindowLimiter::per_minute(clock.clone());

    assert!(limiter.allow("agent", 2, 1));
    clock.advance(Duration::seconds(30));
    assert!(limiter.allow("agent", 2, 1));
    assert!(!limiter.allow("agent", 2, 1));

    clock.advance(Duration::seconds(31));
    assert!(limiter.allow("agent", 2, 1));
    assert!(!limiter.allow("agent", 2, 1));

    clock.advance(Duration::seconds(30));
    assert!(limiter.allow("agent", 2, 1));
}

#[test]
fn test_identities_are_independent() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = SlidingWindowLimiter::per_minute(clock);
    assert!(limiter.allow("a", 1, 1));
    assert!(!limiter.allow("a", 1, 1));
    assert!(limiter.allow("b", 1, 1));
}

#[test]
fn test_key_limit_stricter_than_ip_limit_governs() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = RequestLimiter::new(10, clock);
    let identity = ClientIdentity::keyed("cbk_strict1", IP, None, Some(2));

    assert!(limiter.allow(&identity, 1));
    assert!(limiter.allow(&identity, 1));
    assert!(!limiter.allow(&identity, 1));
}

#[test]
fn test_ip_limit_stricter_than_key_limit_governs() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = RequestLimiter::new(2, clock);
    let identity = ClientIdentity::keyed("cbk_loose01", IP, None, Some(50));

    assert!(limiter.allow(&identity, 1));
    assert!(limiter.allow(&identity, 1));
    assert!(!limiter.allow(&identity, 1));
}

#[test]
fn test_ip_rejection_does_not_consume_key_budget() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = RequestLimiter::new(1, clock);
    let other_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 41));

    let first = ClientIdentity::keyed("cbk_shared1", IP, None, Some(2));
    assert!(limiter.allow(&first, 1));
    assert!(!limiter.allow(&first, 1));

    // The rejected request above must not have used the key's second slot.
    let second = ClientIdentity::keyed("cbk_shared1", other_ip, None, Some(2));
    assert!(limiter.allow(&second, 1));
}

#[test]
fn test_ip_rejection_refunds_key_slot_on_wall_clock() {
    let limiter = RequestLimiter::new(1, Arc::new(SystemClock));
    let other_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42));

    let first = ClientIdentity::keyed("cbk_wallclk", IP, None, Some(2));
    assert!(limiter.allow(&first, 1));
    assert!(!limiter.allow(&first, 1));

    let second = ClientIdentity::keyed("cbk_wallclk", other_ip, None, Some(2));
    assert!(limiter.allow(&second, 1));
}

#[test]
fn test_release_removes_exactly_the_recorded_admission() {
    let limiter = SlidingWindowLimiter::per_minute(Arc::new(SystemClock));
    limiter.check("agent", 3, 1).unwrap();
    let at = limiter.check("agent", 3, 1).unwrap();
    limiter.release("agent", at, 1);
    assert_eq!(limiter.used("agent"), 1);
}

#[test]
fn test_key_without_own_limit_uses_ip_budget_only() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = RequestLimiter::new(3, clock);
    let identity = ClientIdentity::keyed("cbk_default", IP, None, None);
    for _ in 0..3 {
        assert!(limiter.allow(&identity, 1));
    }
    assert!(!limiter.allow(&identity, 1));
}

#[test]
fn test_default_limit_can_change_at_runtime() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = RequestLimiter::new(1, clock);
    let identity = ClientIdentity::anonymous(IP);
    assert!(limiter.allow(&identity, 1));
    assert!(!limiter.allow(&identity, 1));
    limiter.set_default_limit(5);
    assert!(limiter.allow(&identity, 1));
}
