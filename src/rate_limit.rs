use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::RateLimitConfig;

pub const ANONYMOUS_KEY: &str = "anonymous";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub is_rate_limited: bool,
    pub remaining: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientRateLimitDecision {
    pub is_rate_limited: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    count: u32,
    last_seen: Instant,
}

#[derive(Debug)]
struct KeyTable {
    entries: HashMap<String, Entry>,
    last_sweep: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    table: Mutex<KeyTable>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            table: Mutex::new(KeyTable {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        let key = normalized_key(key);
        let now = Instant::now();

        let mut table = self.table.lock();
        table.sweep_expired(now, self.config.interval);

        let new_count = match table.entries.get_mut(key) {
            Some(entry) => {
                if now.duration_since(entry.last_seen) > self.config.interval {
                    entry.count = 0;
                }
                entry.count = entry.count.saturating_add(1);
                entry.last_seen = now;
                entry.count
            }
            None => {
                if table.entries.len() >= self.config.unique_token_per_interval {
                    table.evict_one(now, self.config.interval);
                }
                table.entries.insert(
                    key.to_string(),
                    Entry {
                        count: 1,
                        last_seen: now,
                    },
                );
                1
            }
        };

        RateLimitDecision {
            is_rate_limited: new_count > self.config.limit,
            remaining: self.config.limit.saturating_sub(new_count),
        }
    }
}

impl KeyTable {
    fn sweep_expired(&mut self, now: Instant, interval: Duration) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) <= interval);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "swept expired rate limit entries");
        }
    }

    // A flood of distinct keys can evict live counters early; the capacity
    // bound keeps memory fixed and key provenance is the caller's problem.
    fn evict_one(&mut self, now: Instant, interval: Duration) {
        let victim = self
            .entries
            .iter()
            .find(|(_, entry)| now.duration_since(entry.last_seen) > interval)
            .map(|(key, _)| key.clone())
            .or_else(|| {
                self.entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_seen)
                    .map(|(key, _)| key.clone())
            });

        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

#[derive(Debug)]
pub struct ClientRateLimiter {
    limiter: RateLimiter,
}

impl ClientRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.limiter.config()
    }

    pub fn check(&self, ip: &str, user_id: Option<&str>) -> ClientRateLimitDecision {
        let key = compose_client_key(ip, user_id);
        let decision = self.limiter.check(&key);

        ClientRateLimitDecision {
            is_rate_limited: decision.is_rate_limited,
            remaining: decision.remaining,
            reset_time: Utc::now() + self.limiter.config.interval,
        }
    }
}

fn normalized_key(key: &str) -> &str {
    if key.trim().is_empty() {
        ANONYMOUS_KEY
    } else {
        key
    }
}

fn compose_client_key(ip: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) if !user_id.trim().is_empty() => format!("{ip}:{user_id}"),
        _ => ip.to_string(),
    }
}
