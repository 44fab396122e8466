// Fixed-window rate limiter
//
// Per-client-IP counter stored in the local cache tier only, so the
// request path never pays a remote round trip and the limit is per-worker.
// The observation is pre-increment: the (limit+1)-th request inside
// a window is the first one rejected. Cache failures fail open: the request
// proceeds without throttle headers rather than being rejected.

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cache::{now_secs, LocalCache};
use crate::config::RateLimitSettings;

const ENTITY: &str = "rate_limit";
const COLUMN: &str = "ip";

/// Stored window record, JSON-encoded in the record keyspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowRecord {
    value: u64,
    created_at: u64,
    expires_at: u64,
}

/// Outcome of one limiter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Excluded path, skip-listed IP, or limiter failure (fail open).
    Exempt,
    Allowed {
        limit: u32,
        remaining: u32,
        reset: u64,
    },
    Limited {
        limit: u32,
        retry_after: u64,
    },
}

pub struct RateLimiter {
    cache: LocalCache,
    limit: u32,
    window: u64,
    exclude_paths: HashSet<String>,
    skip_ip: Option<Regex>,
    // get+set below must be one atomic observation per request
    serialize: Mutex<()>,
}

impl RateLimiter {
    pub fn new(cache: LocalCache, settings: &RateLimitSettings) -> Self {
        let skip_ip = settings
            .skip_ip_pattern
            .as_deref()
            .and_then(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::error!(pattern, error = %err, "bad skip_ip_pattern, ignoring");
                    None
                }
            });
        Self {
            cache,
            limit: settings.throttle,
            window: settings.window_secs,
            exclude_paths: settings.exclude_paths.iter().cloned().collect(),
            skip_ip,
            serialize: Mutex::new(()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn check(&self, path: &str, ip: &str) -> RateDecision {
        if self.exclude_paths.contains(path) {
            return RateDecision::Exempt;
        }
        if let Some(skip) = &self.skip_ip {
            if skip.is_match(ip) {
                return RateDecision::Exempt;
            }
        }

        let _guard = self.serialize.lock();
        let now = now_secs();

        let record = self
            .cache
            .get_record(ENTITY, COLUMN, ip)
            .and_then(|json| serde_json::from_str::<WindowRecord>(&json).ok());

        let (count, created_at) = match record {
            Some(record) if now.saturating_sub(record.created_at) < self.window => {
                // Live window: bump the stored counter, observe pre-increment.
                let next = WindowRecord {
                    value: record.value + 1,
                    created_at: record.created_at,
                    expires_at: record.created_at + self.window,
                };
                let remaining_ttl = next.expires_at.saturating_sub(now).max(1);
                if self.write(ip, &next, remaining_ttl).is_none() {
                    return RateDecision::Exempt;
                }
                (record.value, record.created_at)
            }
            _ => {
                // Absent or lapsed window: start a fresh one.
                let fresh = WindowRecord {
                    value: 1,
                    created_at: now,
                    expires_at: now + self.window,
                };
                if self.write(ip, &fresh, self.window).is_none() {
                    return RateDecision::Exempt;
                }
                (1, now)
            }
        };

        let elapsed = now.saturating_sub(created_at);
        let reset = self.window.saturating_sub(elapsed);
        if count >= self.limit as u64 {
            RateDecision::Limited {
                limit: self.limit,
                retry_after: reset,
            }
        } else {
            RateDecision::Allowed {
                limit: self.limit,
                remaining: (self.limit as u64).saturating_sub(count) as u32,
                reset,
            }
        }
    }

    // Fail open: a cache write failure logs and exempts the request.
    fn write(&self, ip: &str, record: &WindowRecord, ttl: u64) -> Option<()> {
        let json = serde_json::to_string(record).ok()?;
        match self.cache.set_record(ENTITY, COLUMN, ip, &json, Some(ttl)) {
            Ok(()) => Some(()),
            Err(err) => {
                tracing::warn!(ip, error = %err, "rate-limit record write failed, failing open");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;

    fn limiter(limit: u32, window: u64) -> RateLimiter {
        let settings = RateLimitSettings {
            throttle: limit,
            window_secs: window,
            exclude_paths: vec!["/health".to_string()],
            skip_ip_pattern: Some("^192\\.168\\.".to_string()),
        };
        RateLimiter::new(LocalCache::new(CacheSettings::default()), &settings)
    }

    fn seed(l: &RateLimiter, ip: &str, value: u64, age: u64) {
        let now = now_secs();
        let record = WindowRecord {
            value,
            created_at: now - age,
            expires_at: now - age + l.window,
        };
        let json = serde_json::to_string(&record).unwrap();
        l.cache
            .set_record(ENTITY, COLUMN, ip, &json, Some(l.window))
            .unwrap();
    }

    #[test]
    fn test_limit_trips_after_limit_requests() {
        let l = limiter(3, 60);
        let ip = "10.0.0.1";
        // Requests 1..=3 pass, 4 and 5 are rejected.
        for expected_remaining in [2u32, 2, 1] {
            match l.check("/api/v1/users", ip) {
                RateDecision::Allowed { remaining, limit, .. } => {
                    assert_eq!(limit, 3);
                    assert_eq!(remaining, expected_remaining);
                }
                other => panic!("expected Allowed, got {:?}", other),
            }
        }
        for _ in 0..2 {
            match l.check("/api/v1/users", ip) {
                RateDecision::Limited { limit, retry_after } => {
                    assert_eq!(limit, 3);
                    assert!(retry_after <= 60);
                }
                other => panic!("expected Limited, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_reset_counts_down_with_window_age() {
        let l = limiter(3, 60);
        let ip = "10.0.0.2";
        seed(&l, ip, 3, 3);
        match l.check("/api/v1/users", ip) {
            RateDecision::Limited { retry_after, .. } => assert_eq!(retry_after, 57),
            other => panic!("expected Limited, got {:?}", other),
        }
        seed(&l, ip, 4, 4);
        match l.check("/api/v1/users", ip) {
            RateDecision::Limited { retry_after, .. } => assert_eq!(retry_after, 56),
            other => panic!("expected Limited, got {:?}", other),
        }
    }

    #[test]
    fn test_lapsed_window_resets() {
        let l = limiter(3, 60);
        let ip = "10.0.0.3";
        seed(&l, ip, 50, 61);
        match l.check("/api/v1/users", ip) {
            RateDecision::Allowed { remaining, reset, .. } => {
                assert_eq!(remaining, 2);
                assert_eq!(reset, 60);
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_excluded_path_and_skip_ip() {
        let l = limiter(1, 60);
        assert_eq!(l.check("/health", "10.0.0.4"), RateDecision::Exempt);
        assert_eq!(
            l.check("/api/v1/users", "192.168.1.9"),
            RateDecision::Exempt
        );
        // The skip pattern anchors at the start.
        assert_ne!(
            l.check("/api/v1/users", "10.192.168.1"),
            RateDecision::Exempt
        );
    }

    #[test]
    fn test_per_ip_isolation() {
        let l = limiter(2, 60);
        let a = "10.0.1.1";
        let b = "10.0.1.2";
        assert!(matches!(l.check("/x", a), RateDecision::Allowed { .. }));
        assert!(matches!(l.check("/x", a), RateDecision::Allowed { .. }));
        assert!(matches!(l.check("/x", a), RateDecision::Limited { .. }));
        // A's window never affects B.
        assert!(matches!(l.check("/x", b), RateDecision::Allowed { .. }));
    }
}
