use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use weft_core::config::RateLimitConfig;
use weft_core::error::{Result, WeftError};

/// Sliding-window admission limiter keyed by free-form strings.
///
/// Rejects rather than queues: callers that want backpressure retry on
/// their own schedule.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    max_tracked_keys: usize,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            max_tracked_keys: 10_000,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_calls, config.window())
        .with_max_tracked_keys(config.max_tracked_keys)
    }

    pub fn with_max_tracked_keys(mut self, n: usize) -> Self {
        self.max_tracked_keys = n.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        match self.calls.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn prune(window: Duration, now: Instant, stamps: &mut VecDeque<Instant>) {
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= window {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop keys with no calls inside the window once too many are tracked.
    fn evict_idle(&self, now: Instant, calls: &mut HashMap<String, VecDeque<Instant>>) {
        if calls.len() <= self.max_tracked_keys {
            return;
        }
        let window = self.window;
        calls.retain(|_, stamps| {
            Self::prune(window, now, stamps);
            !stamps.is_empty()
        });
        debug!(tracked = calls.len(), "Evicted idle rate limit keys");
    }

    /// Admit one call for `key` if the window has room. The timestamp is
    /// recorded only on admission.
    pub fn acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut calls = self.lock();
        let admitted = {
            let stamps = calls.entry(key.to_string()).or_default();
            Self::prune(self.window, now, stamps);
            if stamps.len() < self.max_calls {
                stamps.push_back(now);
                true
            } else {
                false
            }
        };
        self.evict_idle(now, &mut calls);
        admitted
    }

    /// Like [`acquire`](Self::acquire) but rejects with `RateLimited`.
    /// Never sleeps.
    pub fn wait_if_needed(&self, key: &str) -> Result<()> {
        if self.acquire(key) {
            Ok(())
        } else {
            Err(WeftError::RateLimited {
                key: key.to_string(),
            })
        }
    }

    /// Calls still admissible for `key` in the current window.
    pub fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();
        let calls = self.lock();
        let used = calls
            .get(key)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0);
        self.max_calls.saturating_sub(used)
    }

    /// Forget one key, or every key when `None`.
    pub fn reset(&self, key: Option<&str>) {
        let mut calls = self.lock();
        match key {
            Some(k) => {
                calls.remove(k);
            }
            None => calls.clear(),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}
