//! Rate-limit / counter store (component C4): sliding-window counters keyed
//! by `(scope, identifier)`, with lockouts.
//!
//! Grounded on a sliding-window rate limiter that used a Redis sorted set
//! plus a lockout key; reimplemented here as an in-memory ring of event
//! timestamps per key, since the core persists nothing itself.

use dashmap::DashMap;
use std::collections::VecDeque;

use crate::core::now_ms;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_events: u32,
    pub window_ms: u64,
    pub lockout_duration_ms: u64,
    /// When `true`, the event that *reaches* `max_events` is still reported
    /// as a normal (non-locked) outcome, and only the next event finds the
    /// key already locked — this is the "N failures, then locked" shape
    /// `auth_login` needs, where the Nth failed attempt still has to report
    /// `invalid_credentials` rather than `account_locked`. When `false`, the
    /// event reaching `max_events` is itself rejected as locked, which is
    /// what a connect-rate limiter needs since there's no "failure reply" to
    /// hand back before cutting the caller off.
    pub lock_on_exceed: bool,
}

impl RateLimitConfig {
    /// `auth_login` scope: ip+username, locked after 5 consecutive failures
    /// in 300s (the 5th failure still reports `invalid_credentials`; the
    /// 6th observes `account_locked`).
    pub fn auth_login() -> Self {
        Self {
            max_events: 5,
            window_ms: 300_000,
            lockout_duration_ms: 900_000,
            lock_on_exceed: true,
        }
    }

    /// `connect_rate` scope: per-ip connection attempts.
    pub fn connect_rate(max_events: u32, window_ms: u64) -> Self {
        Self {
            max_events,
            window_ms,
            lockout_duration_ms: window_ms,
            lock_on_exceed: false,
        }
    }

    /// `anomaly_profile` scope: ip+user baseline vs burst ratio (simplified
    /// here to a plain window counter at twice the configured baseline; the
    /// true ratio-based profile is an Open Question, see DESIGN.md).
    pub fn anomaly_profile(baseline: u32, window_ms: u64) -> Self {
        Self {
            max_events: baseline * 2,
            window_ms,
            lockout_duration_ms: window_ms,
            lock_on_exceed: false,
        }
    }

    pub fn from_app_config(cfg: &crate::config::AppConfig) -> Self {
        Self {
            max_events: cfg.rate_limit_max,
            window_ms: cfg.rate_limit_window_s * 1000,
            lockout_duration_ms: cfg.lockout_duration_ms,
            lock_on_exceed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Ok { remaining: u32 },
    Locked { retry_after_ms: u64 },
}

#[derive(Default)]
struct Record {
    events: VecDeque<u64>,
    unlock_at: Option<u64>,
}

pub struct RateLimitStore {
    records: DashMap<(String, String), Record>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn key(scope: &str, id: &str) -> (String, String) {
        (scope.to_string(), id.to_string())
    }

    /// Record an event. `success = Some(true)` resets the counter for this
    /// key (a successful login, say); `Some(false)` or `None` counts as an
    /// event toward the window limit.
    pub fn record(
        &self,
        scope: &str,
        id: &str,
        success: Option<bool>,
        config: &RateLimitConfig,
    ) -> RateLimitResult {
        let now = now_ms();
        let mut record = self.records.entry(Self::key(scope, id)).or_default();

        if let Some(unlock_at) = record.unlock_at {
            if now < unlock_at {
                return RateLimitResult::Locked {
                    retry_after_ms: unlock_at - now,
                };
            }
            record.unlock_at = None;
            record.events.clear();
        }

        if success == Some(true) {
            record.events.clear();
            return RateLimitResult::Ok {
                remaining: config.max_events,
            };
        }

        let window_start = now.saturating_sub(config.window_ms);
        while matches!(record.events.front(), Some(t) if *t <= window_start) {
            record.events.pop_front();
        }
        record.events.push_back(now);
        let count = record.events.len() as u32;

        if config.lock_on_exceed {
            // The event that reaches `max_events` still reports a normal
            // outcome; the lock is armed here but only observed by the next
            // call, via the `unlock_at` check at the top of this function.
            if count >= config.max_events {
                record.unlock_at = Some(now + config.lockout_duration_ms);
            }
            return RateLimitResult::Ok {
                remaining: config.max_events.saturating_sub(count),
            };
        }

        if count >= config.max_events {
            record.unlock_at = Some(now + config.lockout_duration_ms);
            return RateLimitResult::Locked {
                retry_after_ms: config.lockout_duration_ms,
            };
        }

        RateLimitResult::Ok {
            remaining: config.max_events - count,
        }
    }

    /// Side-effect-free read of the current state for a key.
    pub fn check(&self, scope: &str, id: &str, config: &RateLimitConfig) -> RateLimitResult {
        let now = now_ms();
        match self.records.get(&Self::key(scope, id)) {
            None => RateLimitResult::Ok {
                remaining: config.max_events,
            },
            Some(record) => {
                if let Some(unlock_at) = record.unlock_at {
                    if now < unlock_at {
                        return RateLimitResult::Locked {
                            retry_after_ms: unlock_at - now,
                        };
                    }
                }
                let window_start = now.saturating_sub(config.window_ms);
                let count = record.events.iter().filter(|t| **t > window_start).count() as u32;
                RateLimitResult::Ok {
                    remaining: config.max_events.saturating_sub(count),
                }
            }
        }
    }

    /// Remove keys with no events and no active lockout.
    pub fn sweep(&self) {
        self.records
            .retain(|_, record| !record.events.is_empty() || record.unlock_at.is_some());
    }

    pub fn clear(&self, scope: &str, id: &str) {
        self.records.remove(&Self::key(scope, id));
    }
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}
