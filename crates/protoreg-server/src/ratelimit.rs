//! Per-IP sliding-window rate limiter (§4.9, §6.3 `rateLimit`).
//!
//! `tower_governor` is not in the retrieval pack; this hand-rolls the
//! window the same way the workspace hand-rolls CAS backoff timing in
//! `protoreg-retry` rather than pulling in a crate for something this
//! small.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    window: Duration,
    max: u32,
    buckets: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request from `ip` and reports whether it is within the
    /// window's budget. Stale timestamps are pruned on every call so the
    /// map never grows past the number of distinct IPs seen in the last
    /// window.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let bucket = buckets.entry(ip).or_default();
        while let Some(oldest) = bucket.front() {
            if now.duration_since(*oldest) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() as u32 >= self.max {
            return false;
        }
        bucket.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_requests_per_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn tracks_ips_independently() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(limiter.check(b));
        assert!(!limiter.check(a));
    }
}
