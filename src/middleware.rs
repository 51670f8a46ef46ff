use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{
    config::{policy_config, ThrottlePolicy},
    monitor::{MonitorError, RequestMonitor},
    rate_limit::{ClientRateLimitDecision, ClientRateLimiter},
};

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
}

#[derive(Clone)]
pub struct RateLimitGate {
    limiter: Arc<ClientRateLimiter>,
    policy: ThrottlePolicy,
    trust_proxy: bool,
}

impl RateLimitGate {
    pub fn new(policy: ThrottlePolicy, trust_proxy: bool) -> Self {
        Self {
            limiter: Arc::new(ClientRateLimiter::new(policy_config(policy))),
            policy,
            trust_proxy,
        }
    }

    pub fn policy(&self) -> ThrottlePolicy {
        self.policy
    }
}

pub async fn enforce_rate_limit(
    State(gate): State<RateLimitGate>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let socket_addr = request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        });
    let ip = client_identity(request.headers(), socket_addr, gate.trust_proxy);
    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.id.clone());

    let decision = gate.limiter.check(&ip, user_id.as_deref());
    if decision.is_rate_limited {
        tracing::warn!(
            policy = gate.policy.as_str(),
            client = %ip,
            "rate limit exceeded"
        );
        return rate_limited_response(gate.limiter.config().limit, decision);
    }

    next.run(request).await
}

pub async fn monitor_requests(
    State(monitor): State<RequestMonitor>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let outcome = monitor
        .monitor(request, move |request| async move {
            Ok::<_, Infallible>(next.run(request).await)
        })
        .await;

    match outcome {
        Ok(response) => response,
        Err(MonitorError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "Request timeout").into_response()
        }
        Err(MonitorError::Handler(infallible)) => match infallible {},
    }
}

pub fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        if let Some(value) = headers
            .get("cf-connecting-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }

        if let Some(value) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }

        if let Some(value) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn rate_limited_response(limit: u32, decision: ClientRateLimitDecision) -> Response {
    let retry_after =
        ceil_millis_to_secs((decision.reset_time - Utc::now()).num_milliseconds());
    let reset_unix = ceil_millis_to_secs(decision.reset_time.timestamp_millis());

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "success": false,
            "error": "Too many requests",
            "code": "RATE_LIMITED",
            "retryAfter": retry_after,
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_unix));
    headers.insert("retry-after", HeaderValue::from(retry_after));
    response
}

fn ceil_millis_to_secs(millis: i64) -> i64 {
    (millis.max(0) as u64).div_ceil(1000) as i64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        middleware::{from_fn, from_fn_with_state},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::MonitorConfig,
        monitor::DEFAULT_RECENT_WINDOW,
    };

    fn resend_request(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/resend")
            .header("x-real-ip", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn resend_router(gate: RateLimitGate) -> Router {
        Router::new()
            .route("/api/resend", get(|| async { "ok" }))
            .route_layer(from_fn_with_state(gate, enforce_rate_limit))
    }

    #[tokio::test]
    async fn over_limit_requests_get_429_with_headers() {
        let gate = RateLimitGate::new(ThrottlePolicy::EmailResend, true);
        assert_eq!(gate.policy(), ThrottlePolicy::EmailResend);
        let app = resend_router(gate);

        for _ in 0..2 {
            let allowed = app.clone().oneshot(resend_request("203.0.113.9")).await.unwrap();
            assert_eq!(allowed.status(), StatusCode::OK);
        }

        let limited = app.clone().oneshot(resend_request("203.0.113.9")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers()["x-ratelimit-limit"], "2");
        assert_eq!(limited.headers()["x-ratelimit-remaining"], "0");
        assert!(limited.headers().contains_key("x-ratelimit-reset"));
        let retry_after: i64 = limited.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=120).contains(&retry_after));

        let body = axum::body::to_bytes(limited.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "RATE_LIMITED");
        assert!(body["retryAfter"].as_i64().unwrap() >= 1);

        let other_client = app.clone().oneshot(resend_request("203.0.113.10")).await.unwrap();
        assert_eq!(other_client.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn authenticated_users_get_their_own_quota() {
        async fn inject_user(mut request: Request<Body>, next: Next) -> Response {
            request.extensions_mut().insert(AuthenticatedUser {
                id: "user-7".to_string(),
            });
            next.run(request).await
        }

        let gate = RateLimitGate::new(ThrottlePolicy::EmailResend, true);
        let anonymous = resend_router(gate.clone());
        let signed_in = Router::new()
            .route("/api/resend", get(|| async { "ok" }))
            .route_layer(from_fn_with_state(gate.clone(), enforce_rate_limit))
            .route_layer(from_fn(inject_user));

        for _ in 0..2 {
            let allowed = anonymous.clone().oneshot(resend_request("203.0.113.9")).await.unwrap();
            assert_eq!(allowed.status(), StatusCode::OK);
        }
        let limited = anonymous.clone().oneshot(resend_request("203.0.113.9")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        for _ in 0..2 {
            let allowed = signed_in.clone().oneshot(resend_request("203.0.113.9")).await.unwrap();
            assert_eq!(allowed.status(), StatusCode::OK);
        }
        let limited = signed_in.clone().oneshot(resend_request("203.0.113.9")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn monitor_adapter_passes_responses_through_and_records() {
        let monitor = RequestMonitor::new(MonitorConfig::without_timeout());
        let app = Router::new()
            .route("/api/widgets", get(|| async { (StatusCode::CREATED, "made") }))
            .route_layer(from_fn_with_state(monitor.clone(), monitor_requests));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/widgets?source=test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let metrics = monitor.recent_metrics(DEFAULT_RECENT_WINDOW);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].path, "/api/widgets");
        assert_eq!(metrics[0].method, "GET");
        assert_eq!(metrics[0].status, 201);
    }

    #[tokio::test]
    async fn monitor_adapter_maps_timeout_to_504() {
        let monitor = RequestMonitor::new(MonitorConfig {
            handler_timeout: Some(Duration::from_millis(50)),
            ..MonitorConfig::default()
        });
        let app = Router::new()
            .route(
                "/api/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "late"
                }),
            )
            .route_layer(from_fn_with_state(monitor.clone(), monitor_requests));

        let response = app
            .oneshot(Request::builder().uri("/api/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(monitor.recent_metrics(DEFAULT_RECENT_WINDOW)[0].status, 500);
    }

    #[test]
    fn rejection_seconds_round_up() {
        assert_eq!(ceil_millis_to_secs(0), 0);
        assert_eq!(ceil_millis_to_secs(1), 1);
        assert_eq!(ceil_millis_to_secs(1000), 1);
        assert_eq!(ceil_millis_to_secs(1001), 2);
        assert_eq!(ceil_millis_to_secs(-250), 0);
    }

    #[test]
    fn client_identity_prefers_proxy_headers_in_order() {
        let socket = Some(SocketAddr::from(([192, 0, 2, 1], 4000)));

        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.8"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        assert_eq!(client_identity(&headers, socket, true), "198.51.100.7");

        headers.remove("cf-connecting-ip");
        assert_eq!(client_identity(&headers, socket, true), "198.51.100.8");

        headers.remove("x-real-ip");
        assert_eq!(client_identity(&headers, socket, true), "203.0.113.5");

        assert_eq!(client_identity(&headers, socket, false), "192.0.2.1");
        assert_eq!(client_identity(&HeaderMap::new(), None, true), "unknown");
    }
}
