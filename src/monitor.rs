use std::{
    collections::VecDeque,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{body::Body, response::Response};
use chrono::{DateTime, Utc};
use http::Request;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::MonitorConfig;

pub const DEFAULT_RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Serialize)]
pub struct RequestMetric {
    pub path: String,
    pub method: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: u16,
}

#[derive(Debug, Error)]
pub enum MonitorError<E> {
    #[error("request timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Handler(E),
}

#[derive(Clone)]
pub struct RequestMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: MonitorConfig,
    metrics: Mutex<VecDeque<RequestMetric>>,
}

impl RequestMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                metrics: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub async fn monitor<F, Fut, E>(
        &self,
        request: Request<Body>,
        handler: F,
    ) -> Result<Response, MonitorError<E>>
    where
        F: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Result<Response, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let path = request.uri().path().to_string();
        let method = request.method().to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        // The task is never aborted: when a deadline wins the race it is
        // abandoned and keeps running detached until it finishes on its own.
        let work = tokio::spawn(handler(request));

        let joined = match self.inner.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(joined) => joined,
                Err(_) => {
                    let duration_ms = elapsed_ms(started);
                    self.record(RequestMetric {
                        path: path.clone(),
                        method: method.clone(),
                        started_at,
                        duration_ms,
                        status: 500,
                    });
                    tracing::error!(
                        method = %method,
                        path = %path,
                        duration_ms,
                        timeout_ms = limit.as_millis() as u64,
                        "request abandoned after timeout"
                    );
                    return Err(MonitorError::Timeout(limit));
                }
            },
            None => work.await,
        };

        let duration_ms = elapsed_ms(started);

        match joined {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                self.record(RequestMetric {
                    path: path.clone(),
                    method: method.clone(),
                    started_at,
                    duration_ms,
                    status,
                });
                tracing::info!(
                    method = %method,
                    path = %path,
                    duration_ms,
                    status,
                    "request completed"
                );
                Ok(response)
            }
            Ok(Err(error)) => {
                self.record(RequestMetric {
                    path: path.clone(),
                    method: method.clone(),
                    started_at,
                    duration_ms,
                    status: 500,
                });
                tracing::error!(
                    method = %method,
                    path = %path,
                    duration_ms,
                    error = %error,
                    "request failed"
                );
                Err(MonitorError::Handler(error))
            }
            Err(join_error) => {
                self.record(RequestMetric {
                    path: path.clone(),
                    method: method.clone(),
                    started_at,
                    duration_ms,
                    status: 500,
                });
                tracing::error!(
                    method = %method,
                    path = %path,
                    duration_ms,
                    "request handler panicked"
                );
                std::panic::resume_unwind(join_error.into_panic());
            }
        }
    }

    pub fn recent_metrics(&self, window: Duration) -> Vec<RequestMetric> {
        let cutoff = Utc::now() - window;
        self.inner
            .metrics
            .lock()
            .iter()
            .filter(|metric| metric.started_at > cutoff)
            .cloned()
            .collect()
    }

    fn record(&self, metric: RequestMetric) {
        let cutoff = Utc::now() - self.inner.config.retention;
        let mut metrics = self.inner.metrics.lock();

        while let Some(front) = metrics.front() {
            if front.started_at < cutoff {
                metrics.pop_front();
            } else {
                break;
            }
        }
        if metrics.len() >= self.inner.config.max_entries {
            metrics.pop_front();
        }

        metrics.push_back(metric);
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
