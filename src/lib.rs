pub mod config;
pub mod middleware;
pub mod monitor;
pub mod rate_limit;

pub use config::{policy_config, MonitorConfig, RateLimitConfig, ThrottlePolicy};
pub use middleware::{
    client_identity, enforce_rate_limit, monitor_requests, AuthenticatedUser, RateLimitGate,
};
pub use monitor::{MonitorError, RequestMetric, RequestMonitor, DEFAULT_RECENT_WINDOW};
pub use rate_limit::{
    ClientRateLimitDecision, ClientRateLimiter, RateLimitDecision, RateLimiter, ANONYMOUS_KEY,
};
