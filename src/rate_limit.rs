//! Sliding-window rate limiting
//!
//! Admission control per identity plus a global ceiling at twice the
//! per-identity limit. Windows are pruned lazily on every query and
//! record; an identity with no recent requests holds no entry at all.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// Point-in-time stats for one identity, used by the rate-limit notice
/// and the `stats` command.
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub user_requests: usize,
    pub user_limit: usize,
    pub global_requests: usize,
    pub global_limit: usize,
    pub window_secs: u64,
}

#[derive(Default)]
struct Windows {
    user: HashMap<String, Vec<Instant>>,
    global: Vec<Instant>,
}

/// Sliding-window rate limiter shared across the dispatch path and
/// generation tasks. One coarse lock; call frequency is low relative to
/// network latency.
pub struct RateLimiter {
    enabled: bool,
    max_requests: usize,
    time_window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_requests: config.max_requests,
            time_window: config.time_window,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Pure admission query: does this identity have budget right now?
    pub fn is_allowed(&self, identity: &str) -> bool {
        self.is_allowed_at(identity, Instant::now())
    }

    /// Record an admitted request for this identity.
    pub fn record(&self, identity: &str) {
        self.record_at(identity, Instant::now());
    }

    fn is_allowed_at(&self, identity: &str, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let mut windows = self.windows.lock();
        self.prune(&mut windows, now);

        let user_count = windows.user.get(identity).map_or(0, Vec::len);
        if user_count >= self.max_requests {
            debug!(identity, user_count, "rate limit: user window full");
            return false;
        }

        // Global ceiling is twice the per-identity limit.
        if windows.global.len() >= self.max_requests * 2 {
            debug!(identity, global_count = windows.global.len(), "rate limit: global window full");
            return false;
        }

        true
    }

    fn record_at(&self, identity: &str, now: Instant) {
        if !self.enabled {
            return;
        }

        let mut windows = self.windows.lock();
        windows.user.entry(identity.to_string()).or_default().push(now);
        windows.global.push(now);
        self.prune(&mut windows, now);
    }

    /// Drop timestamps that fell out of the window; identities left with
    /// an empty window lose their entry entirely.
    fn prune(&self, windows: &mut Windows, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.time_window) else {
            return;
        };

        windows.user.retain(|_, stamps| {
            stamps.retain(|&t| t > cutoff);
            !stamps.is_empty()
        });
        windows.global.retain(|&t| t > cutoff);
    }

    /// Current usage for one identity.
    pub fn stats(&self, identity: &str) -> RateLimitStats {
        self.stats_at(identity, Instant::now())
    }

    fn stats_at(&self, identity: &str, now: Instant) -> RateLimitStats {
        let mut windows = self.windows.lock();
        self.prune(&mut windows, now);

        RateLimitStats {
            user_requests: windows.user.get(identity).map_or(0, Vec::len),
            user_limit: self.max_requests,
            global_requests: windows.global.len(),
            global_limit: self.max_requests * 2,
            window_secs: self.time_window.as_secs(),
        }
    }

    /// Clear one identity's window.
    pub fn reset(&self, identity: &str) {
        self.windows.lock().user.remove(identity);
    }

    /// Clear every window, global included.
    pub fn reset_all(&self) {
        let mut windows = self.windows.lock();
        windows.user.clear();
        windows.global.clear();
    }
}
