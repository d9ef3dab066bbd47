//! Request logging with performance monitoring.
//!
//! Emits two structured events per request on the `request_logger` target:
//! one before the inner service runs and one after it answers. The response
//! also receives an `X-Processing-Time` header (seconds).
//!
//! Requests slower than the configured threshold are logged again as warnings.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use axum::http::{Request, Response};
use chrono::Utc;
use tower::{Layer, Service};
use tracing::{info, warn};

use super::context::RequestIdExt;
use super::ip::ClientIpExt;
use crate::metrics;
use crate::models::{Principal, describe_user};

/// Tracing target for request and response events.
pub const LOG_TARGET: &str = "request_logger";

/// Response header carrying the processing time in seconds.
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time";

/// Default slow request threshold.
pub const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(2);

/// Request logging layer.
#[derive(Clone)]
pub struct RequestLoggingLayer {
    slow_threshold: Arc<Duration>,
}

impl RequestLoggingLayer {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold: Arc::new(slow_threshold),
        }
    }
}

impl Default for RequestLoggingLayer {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_REQUEST_THRESHOLD)
    }
}

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingService {
            inner,
            slow_threshold: self.slow_threshold.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestLoggingService<S> {
    inner: S,
    slow_threshold: Arc<Duration>,
}

impl<S> Service<Request<Body>> for RequestLoggingService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let start = Instant::now();

        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let principal = req.extensions().get::<Principal>().cloned();
        let user = describe_user(principal.as_ref());
        let request_id = req.request_id().map(str::to_string);

        info!(
            target: LOG_TARGET,
            event = "request",
            timestamp = %Utc::now().to_rfc3339(),
            method = %method,
            path = %path,
            user = %user,
            ip = %req.client_ip(),
            user_agent = header_str(&req, USER_AGENT),
            content_type = header_str(&req, CONTENT_TYPE),
            request_id = request_id.as_deref().unwrap_or_default(),
            "Request received"
        );

        let slow_threshold = *self.slow_threshold;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            let elapsed = start.elapsed();
            let processing_time = round_seconds(elapsed);
            let status = response.status().as_u16();

            info!(
                target: LOG_TARGET,
                event = "response",
                timestamp = %Utc::now().to_rfc3339(),
                method = %method,
                path = %path,
                user = %user,
                status,
                processing_time,
                request_id = request_id.as_deref().unwrap_or_default(),
                "Response sent"
            );

            if elapsed > slow_threshold {
                let username = principal
                    .as_ref()
                    .map(|p| p.username.as_str())
                    .unwrap_or("anonymous");
                warn!(
                    target: LOG_TARGET,
                    method = %method,
                    path = %path,
                    duration_secs = processing_time,
                    user = username,
                    "Slow request"
                );
            }

            if let Ok(value) = HeaderValue::from_str(&processing_time.to_string()) {
                response.headers_mut().insert(PROCESSING_TIME_HEADER, value);
            }

            metrics::record_request(&method, status, elapsed.as_secs_f64());

            Ok(response)
        })
    }
}

fn header_str<B>(req: &Request<B>, name: axum::http::HeaderName) -> &str {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Seconds rounded to four decimal places.
fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 10_000.0).round() / 10_000.0
}
