use std::{env, time::Duration};

use anyhow::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub interval: Duration,
    pub unique_token_per_interval: usize,
    pub limit: u32,
}

impl RateLimitConfig {
    pub const fn new(limit: u32, interval: Duration) -> Self {
        Self {
            interval,
            unique_token_per_interval: DEFAULT_UNIQUE_TOKENS,
            limit,
        }
    }

    pub const fn with_unique_token_per_interval(
        mut self,
        unique_token_per_interval: usize,
    ) -> Self {
        self.unique_token_per_interval = unique_token_per_interval;
        self
    }
}

pub const DEFAULT_UNIQUE_TOKENS: usize = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ThrottlePolicy {
    Auth,
    PasswordReset,
    EmailResend,
    Api,
    ApiStrict,
}

impl ThrottlePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ThrottlePolicy::Auth => "auth",
            ThrottlePolicy::PasswordReset => "password-reset",
            ThrottlePolicy::EmailResend => "email-resend",
            ThrottlePolicy::Api => "api",
            ThrottlePolicy::ApiStrict => "api-strict",
        }
    }
}

pub fn policy_config(policy: ThrottlePolicy) -> RateLimitConfig {
    match policy {
        ThrottlePolicy::Auth => RateLimitConfig::new(5, Duration::from_secs(60)),
        ThrottlePolicy::PasswordReset => RateLimitConfig::new(3, Duration::from_secs(300)),
        ThrottlePolicy::EmailResend => RateLimitConfig::new(2, Duration::from_secs(120)),
        ThrottlePolicy::Api => RateLimitConfig::new(60, Duration::from_secs(60)),
        ThrottlePolicy::ApiStrict => RateLimitConfig::new(10, Duration::from_secs(60)),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    pub handler_timeout: Option<Duration>,
    pub retention: Duration,
    pub max_entries: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Some(DEFAULT_HANDLER_TIMEOUT),
            retention: DEFAULT_METRICS_RETENTION,
            max_entries: DEFAULT_METRICS_MAX_ENTRIES,
        }
    }
}

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_METRICS_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_METRICS_MAX_ENTRIES: usize = 10_000;

impl MonitorConfig {
    pub fn without_timeout() -> Self {
        Self {
            handler_timeout: None,
            ..Self::default()
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if env::var("NODE_ENV")
            .ok()
            .map(|value| value.trim().eq_ignore_ascii_case("test"))
            .unwrap_or(false)
        {
            config.handler_timeout = None;
        }

        if let Some(timeout_ms) = parse_env_u64("REQUEST_TIMEOUT_MS")? {
            config.handler_timeout = if timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(timeout_ms))
            };
        }

        if let Some(retention_secs) = parse_env_u64("METRICS_RETENTION_SECS")? {
            config.retention = Duration::from_secs(retention_secs);
        }

        if let Some(max_entries) = parse_env_u64("METRICS_MAX_ENTRIES")? {
            config.max_entries = max_entries as usize;
        }

        Ok(config)
    }
}

fn parse_env_u64(name: &str) -> anyhow::Result<Option<u64>> {
    match env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{name} must be a non-negative integer, got {value:?}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
