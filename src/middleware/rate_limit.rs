//! Rate limiting middleware using the Generic Cell Rate Algorithm.
//!
//! # Algorithm
//!
//! Uses the Governor crate (GCRA, "leaky bucket as a meter"). Each rule of
//! `requests` per `window` seconds admits `requests` requests at once and
//! replenishes one request every `window / requests` seconds.
//!
//! # Limit Types
//!
//! | Request                       | Limit type |
//! |-------------------------------|------------|
//! | `/api/auth/...`               | `auth`     |
//! | `POST /api/messages/...`      | `messages` |
//! | any other `/api/...`          | `api`      |
//! | everything else               | `default`  |
//!
//! Authenticated callers are keyed by user ID, anonymous callers by client IP.
//!
//! # Response Headers
//!
//! Admitted requests:
//! - `X-RateLimit-Limit`: Requests per window
//! - `X-RateLimit-Remaining`: Requests available right now
//! - `X-RateLimit-Reset`: Unix time at which the full budget is available again
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the next request will be accepted
//! - `X-RateLimit-Limit`, `X-RateLimit-Remaining: 0`

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Method, Request, Response};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::ClientIpExt;
use crate::config::{LimitType, RateLimitRule, RateLimits};
use crate::error::{AppError, AppResult, Rejection};
use crate::models::Principal;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Keyed limiter that reports remaining capacity on success.
type KeyedLimiter = RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

impl LimitType {
    /// Classify a request by path and method.
    pub fn for_request(method: &Method, path: &str) -> Self {
        if path.starts_with("/api/auth/") {
            LimitType::Auth
        } else if path.starts_with("/api/messages/") && method == Method::POST {
            LimitType::Messages
        } else if path.starts_with("/api/") {
            LimitType::Api
        } else {
            LimitType::Default
        }
    }
}

/// Limiter key for a caller under a limit type.
pub fn rate_limit_key(limit_type: LimitType, principal: Option<&Principal>, client_ip: &str) -> String {
    match principal {
        Some(p) => format!("{limit_type}:user:{}", p.id),
        None => format!("{limit_type}:ip:{client_ip}"),
    }
}

/// Budget left for a caller after an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the full budget is restored
    pub reset: u64,
}

struct RuleLimiter {
    limit_type: LimitType,
    rule: RateLimitRule,
    period: Duration,
    limiter: KeyedLimiter,
}

/// One keyed limiter per limit type.
pub struct RateLimitRegistry {
    limiters: Vec<RuleLimiter>,
}

impl RateLimitRegistry {
    /// Build limiters for every limit type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a rule has zero requests or window.
    pub fn new(limits: &RateLimits) -> AppResult<Self> {
        let limiters = LimitType::ALL
            .into_iter()
            .map(|limit_type| {
                let rule = limits.rule(limit_type);
                let burst = NonZeroU32::new(rule.requests).ok_or_else(|| {
                    AppError::ConfigError(format!("RATE_LIMITS.{limit_type}.requests must be > 0"))
                })?;
                let period = rule.window_duration() / rule.requests;
                let quota = Quota::with_period(period)
                    .ok_or_else(|| {
                        AppError::ConfigError(format!(
                            "RATE_LIMITS.{limit_type}.window must be > 0"
                        ))
                    })?
                    .allow_burst(burst);

                debug!(
                    limit_type = %limit_type,
                    requests = rule.requests,
                    window = rule.window,
                    "Rate limiter configured"
                );

                Ok(RuleLimiter {
                    limit_type,
                    rule,
                    period,
                    limiter: RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>(),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self { limiters })
    }

    fn entry(&self, limit_type: LimitType) -> Option<&RuleLimiter> {
        self.limiters
            .iter()
            .find(|l| l.limit_type == limit_type)
            .or_else(|| self.limiters.iter().find(|l| l.limit_type == LimitType::Default))
    }

    /// Rule in force for a limit type.
    pub fn rule(&self, limit_type: LimitType) -> Option<RateLimitRule> {
        self.entry(limit_type).map(|l| l.rule)
    }

    /// Count one request for `key` under `limit_type`.
    pub fn check(&self, limit_type: LimitType, key: &str) -> Result<RateLimitStatus, Rejection> {
        let Some(entry) = self.entry(limit_type) else {
            return Ok(RateLimitStatus {
                limit: 0,
                remaining: 0,
                reset: unix_now(),
            });
        };

        match entry.limiter.check_key(&key.to_string()) {
            Ok(snapshot) => {
                let remaining = snapshot.remaining_burst_capacity();
                let used = entry.rule.requests.saturating_sub(remaining);
                let refill = (entry.period.as_secs_f64() * f64::from(used)).ceil() as u64;

                Ok(RateLimitStatus {
                    limit: entry.rule.requests,
                    remaining,
                    reset: unix_now() + refill,
                })
            }
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after = wait_time.as_secs_f64().ceil().max(1.0) as u64;

                Err(Rejection::RateLimited {
                    limit_type,
                    retry_after,
                    rule: entry.rule,
                })
            }
        }
    }

    /// Drop keys whose budget has fully replenished.
    pub fn retain_recent(&self) {
        for entry in &self.limiters {
            entry.limiter.retain_recent();
        }
    }

    /// Number of tracked keys across all limit types.
    pub fn len(&self) -> usize {
        self.limiters.iter().map(|l| l.limiter.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Rate limiting layer for the Tower middleware stack.
#[derive(Clone)]
pub struct RateLimitLayer {
    registry: Arc<RateLimitRegistry>,
}

impl RateLimitLayer {
    pub fn new(registry: Arc<RateLimitRegistry>) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            registry: self.registry.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    registry: Arc<RateLimitRegistry>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let limit_type = LimitType::for_request(req.method(), req.uri().path());
        let key = rate_limit_key(
            limit_type,
            req.extensions().get::<Principal>(),
            &req.client_ip(),
        );
        let verdict = self.registry.check(limit_type, &key);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let status = match verdict {
                Ok(status) => status,
                Err(rejection) => {
                    warn!(key = %key, path = %req.uri().path(), "Rate limit exceeded");
                    return Ok(rejection.into_response());
                }
            };

            let mut response = inner.call(req).await?;
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(status.limit));
            headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(status.remaining));
            headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(status.reset));

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use tower::ServiceExt;

    async fn ok(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(Response::new(Body::empty()))
    }

    fn registry(auth: RateLimitRule) -> Arc<RateLimitRegistry> {
        let limits = RateLimits {
            auth: Some(auth),
            ..RateLimits::default()
        };
        Arc::new(RateLimitRegistry::new(&limits).unwrap())
    }

    #[test]
    fn test_classify_requests() {
        assert_eq!(
            LimitType::for_request(&Method::POST, "/api/auth/login/"),
            LimitType::Auth
        );
        assert_eq!(
            LimitType::for_request(&Method::POST, "/api/messages/"),
            LimitType::Messages
        );
        assert_eq!(
            LimitType::for_request(&Method::GET, "/api/messages/"),
            LimitType::Api
        );
        assert_eq!(
            LimitType::for_request(&Method::GET, "/admin/"),
            LimitType::Default
        );
    }

    #[test]
    fn test_rate_limit_key() {
        let principal = Principal::new(42, "erin", "user");

        assert_eq!(
            rate_limit_key(LimitType::Api, Some(&principal), "10.0.0.1"),
            "api:user:42"
        );
        assert_eq!(
            rate_limit_key(LimitType::Auth, None, "10.0.0.1"),
            "auth:ip:10.0.0.1"
        );
    }

    #[test]
    fn test_zero_rule_rejected() {
        let limits = RateLimits {
            default: RateLimitRule::new(0, 60),
            ..RateLimits::default()
        };
        assert!(RateLimitRegistry::new(&limits).is_err());
    }

    #[test]
    fn test_budget_exhaustion() {
        let registry = registry(RateLimitRule::new(3, 300));

        let first = registry.check(LimitType::Auth, "auth:ip:1.1.1.1").unwrap();
        assert_eq!(first.limit, 3);
        assert_eq!(first.remaining, 2);
        assert!(first.reset > unix_now());

        registry.check(LimitType::Auth, "auth:ip:1.1.1.1").unwrap();
        let last = registry.check(LimitType::Auth, "auth:ip:1.1.1.1").unwrap();
        assert_eq!(last.remaining, 0);

        match registry.check(LimitType::Auth, "auth:ip:1.1.1.1") {
            Err(Rejection::RateLimited {
                limit_type,
                retry_after,
                rule,
            }) => {
                assert_eq!(limit_type, LimitType::Auth);
                assert!(retry_after >= 1);
                assert_eq!(rule, RateLimitRule::new(3, 300));
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }

        // Other keys keep their own budget
        assert!(registry.check(LimitType::Auth, "auth:ip:2.2.2.2").is_ok());
    }

    #[tokio::test]
    async fn test_layer_headers_and_rejection() {
        let layer = RateLimitLayer::new(registry(RateLimitRule::new(1, 60)));

        let make_req = || {
            Request::builder()
                .uri("/api/auth/login/")
                .header("x-forwarded-for", "192.0.2.50")
                .body(Body::empty())
                .unwrap()
        };

        let response = layer
            .layer(tower::service_fn(ok))
            .oneshot(make_req())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT_HEADER], "1");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "0");

        let response = layer
            .layer(tower::service_fn(ok))
            .oneshot(make_req())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
    }
}
