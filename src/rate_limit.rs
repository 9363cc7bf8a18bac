//! Fixed-window admission control keyed by client identity.
//!
//! Each client gets a counter and a reset instant. A window is created on the first
//! request, restarts once its duration has elapsed, and is dropped after it has been idle
//! for the configured eviction period.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// Outcome of one admission check, with the numbers a transport puts in headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
    pub retry_after: Duration,
}

impl RateDecision {
    pub fn into_result(self) -> Result<Self, ServiceError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(ServiceError::RateLimited {
                // Round up so a client never retries a moment too early.
                retry_after_secs: self.retry_after.as_secs()
                    + u64::from(self.retry_after.subsec_nanos() > 0),
            })
        }
    }
}

/// Read-only view of a client's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    idle_ttl: Duration,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, idle_ttl: Duration) -> Self {
        Self {
            limit,
            window,
            idle_ttl,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request from `client` and say whether it is admitted.
    pub fn allow(&self, client: &str) -> bool {
        self.check(client).allowed
    }

    pub fn check(&self, client: &str) -> RateDecision {
        self.check_at(client, Instant::now())
    }

    pub fn check_at(&self, client: &str, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(client.to_string()).or_insert(RateWindow {
            count: 0,
            reset_at: now + self.window,
        });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }

        window.count = window.count.saturating_add(1);
        let allowed = window.count <= self.limit;
        if !allowed {
            tracing::debug!(client, count = window.count, limit = self.limit, "request rate limited");
        }

        RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(window.count),
            reset_at: window.reset_at,
            retry_after: window.reset_at.saturating_duration_since(now),
        }
    }

    /// Current window for `client` without counting a request.
    pub fn status_at(&self, client: &str, now: Instant) -> RateStatus {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        match windows.get(client).filter(|w| now < w.reset_at) {
            Some(w) => RateStatus {
                limit: self.limit,
                remaining: self.limit.saturating_sub(w.count),
                reset_in_secs: w.reset_at.saturating_duration_since(now).as_secs(),
            },
            None => RateStatus {
                limit: self.limit,
                remaining: self.limit,
                reset_in_secs: self.window.as_secs(),
            },
        }
    }

    /// Drop windows idle for longer than the eviction period. Returns how many went.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at + self.idle_ttl);
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
