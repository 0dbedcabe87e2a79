//! Per-identity sliding-window rate limiter
//!
//! Each identity owns an ordered list of admission timestamps. A check prunes
//! entries outside the trailing window, rejects when the remaining count has
//! reached the limit, and otherwise records the new admission. Rejected calls
//! are not recorded, so they never extend the caller's lockout.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

/// Sliding-window limiter shared by all identities
#[derive(Debug)]
pub struct RateLimiter {
    /// Admissions allowed per identity within `window`
    limit: usize,
    /// Trailing window length (one hour in production)
    window: TimeDelta,
    /// Admission timestamps per identity, oldest first
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Create a limiter admitting `limit_per_hour` requests per identity per hour
    pub fn per_hour(limit_per_hour: usize) -> Self {
        Self::new(limit_per_hour, TimeDelta::hours(1))
    }

    pub fn new(limit: usize, window: TimeDelta) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn admit(&self, identity: &str) -> bool {
        self.admit_at(identity, Utc::now()).await
    }

    /// Admit or reject a request for `identity` at time `now`
    ///
    /// Prune and append happen under a single lock acquisition.
    pub async fn admit_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock().await;
        let stamps = windows.entry(identity.to_owned()).or_default();
        prune(stamps, now - self.window);

        if stamps.len() >= self.limit {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Number of admissions for `identity` still inside the window
    pub async fn usage_at(&self, identity: &str, now: DateTime<Utc>) -> usize {
        let mut windows = self.windows.lock().await;
        match windows.get_mut(identity) {
            Some(stamps) => {
                prune(stamps, now - self.window);
                stamps.len()
            }
            None => 0,
        }
    }
}

/// Drop timestamps at or before `cutoff`
fn prune(stamps: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while stamps.front().is_some_and(|ts| *ts <= cutoff) {
        stamps.pop_front();
    }
}
