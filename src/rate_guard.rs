//! Request-rate guard.
//!
//! Fixed-window counters keyed by client identity. Counters live in a
//! sharded map so unrelated keys never contend on one lock; each key is
//! updated under its shard lock, so concurrent increments are never lost.

use crate::signals::RequestContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Longest User-Agent prefix used in composite keys.
const KEY_USER_AGENT_LEN: usize = 50;

/// Admissions between opportunistic sweeps.
const SWEEP_EVERY: u64 = 1000;

/// How a rate key is derived from a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Raw client IP
    #[default]
    ClientIp,
    /// Authenticated identity or API key, falling back to IP
    Identity,
    /// Client IP plus a User-Agent prefix
    IpUserAgent,
}

/// Build the rate key for a request.
pub fn rate_key(strategy: KeyStrategy, ctx: &RequestContext) -> String {
    let ip = ctx
        .client_ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown");

    match strategy {
        KeyStrategy::ClientIp => format!("ratelimit:{}", ip),
        KeyStrategy::Identity => {
            let identity = ctx
                .identity
                .as_deref()
                .or_else(|| ctx.header("x-api-key"))
                .map(str::trim)
                .filter(|id| !id.is_empty());
            match identity {
                Some(id) => format!("ratelimit:id:{}", id),
                None => format!("ratelimit:{}", ip),
            }
        }
        KeyStrategy::IpUserAgent => {
            let ua: String = ctx
                .user_agent()
                .filter(|ua| !ua.is_empty())
                .unwrap_or("unknown")
                .chars()
                .take(KEY_USER_AGENT_LEN)
                .collect();
            format!("ratelimit:{}:{}", ip, ua)
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    /// Maximum calls per window
    pub limit: u32,
    /// Calls counted in the current window, including this one
    pub count: u32,
    pub remaining: u32,
    /// Time until the current window ends
    pub reset_in: Duration,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Keyed fixed-window counter.
pub struct RateGuard {
    windows: DashMap<String, RateWindow>,
    window: Duration,
    max_requests: u32,
    admissions: AtomicU64,
}

impl RateGuard {
    /// Allow `max_requests` per key in each `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
            admissions: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Count a call for `key` now.
    pub fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, Instant::now())
    }

    /// Count a call for `key` at `now`.
    pub fn admit_at(&self, key: &str, now: Instant) -> Admission {
        self.maybe_sweep(now);

        let (started, count) = {
            let mut entry = self
                .windows
                .entry(key.to_string())
                .or_insert(RateWindow { started: now, count: 0 });

            if now.saturating_duration_since(entry.started) >= self.window {
                *entry = RateWindow { started: now, count: 0 };
            }
            entry.count = entry.count.saturating_add(1);
            (entry.started, entry.count)
        };

        let allowed = count <= self.max_requests;
        let reset_in = self
            .window
            .saturating_sub(now.saturating_duration_since(started));
        let reset_at = chrono::Duration::from_std(reset_in)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if allowed {
            debug!(key, count, limit = self.max_requests, "Rate guard admitted");
        } else {
            warn!(key, count, limit = self.max_requests, "Rate limit exceeded");
        }

        Admission {
            allowed,
            limit: self.max_requests,
            count,
            remaining: self.max_requests.saturating_sub(count),
            reset_in,
            reset_at,
        }
    }

    /// Calls counted for `key` in its live window.
    pub fn usage(&self, key: &str) -> Option<u32> {
        let now = Instant::now();
        self.windows
            .get(key)
            .filter(|w| now.saturating_duration_since(w.started) < self.window)
            .map(|w| w.count)
    }

    /// Forget `key`.
    pub fn reset(&self, key: &str) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop windows that have elapsed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "Rate windows swept");
        }
        removed
    }

    fn maybe_sweep(&self, now: Instant) {
        let count = self.admissions.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % SWEEP_EVERY == 0 {
            self.sweep_at(now);
        }
    }

    /// Sweep periodically until the guard is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let guard: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match guard.upgrade() {
                    Some(guard) => {
                        guard.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
