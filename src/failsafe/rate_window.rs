//! Sliding-window self throttle
//!
//! Keeps the instants of recent calls; a call is admitted while fewer than
//! `max_requests` fall inside the trailing window.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Sliding-window rate limiter for outbound calls
pub struct RateWindow {
    enabled: bool,
    window: Duration,
    max_requests: usize,
    calls: Mutex<VecDeque<Instant>>,
}

/// Current window usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateWindowSnapshot {
    /// Whether the window is enforced
    pub enabled: bool,
    /// Calls inside the current window
    pub used: usize,
    /// Maximum calls per window
    pub limit: usize,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl RateWindow {
    /// Create from config
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: config.window,
            max_requests: config.max_requests,
            calls: Mutex::new(VecDeque::with_capacity(config.max_requests.min(1024))),
        }
    }

    /// Admit a call, or return how long until the oldest entry leaves the window
    pub fn try_acquire(&self) -> Result<(), Duration> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut calls = self.calls.lock();
        prune(&mut calls, now, self.window);

        if calls.len() >= self.max_requests {
            let wait = calls
                .front()
                .map_or(self.window, |oldest| (*oldest + self.window).saturating_duration_since(now));
            return Err(wait);
        }

        calls.push_back(now);
        Ok(())
    }

    /// Calls inside the current window
    pub fn len(&self) -> usize {
        let mut calls = self.calls.lock();
        prune(&mut calls, Instant::now(), self.window);
        calls.len()
    }

    /// Whether no calls fall inside the current window
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usage summary for diagnostics
    pub fn snapshot(&self) -> RateWindowSnapshot {
        RateWindowSnapshot {
            enabled: self.enabled,
            used: self.len(),
            limit: self.max_requests,
            window_seconds: self.window.as_secs(),
        }
    }
}

fn prune(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while calls
        .front()
        .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window)
    {
        calls.pop_front();
    }
}
