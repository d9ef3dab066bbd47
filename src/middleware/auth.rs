//! Identity middleware: resolves the caller's [`Principal`] from credentials.
//!
//! # Credentials
//!
//! Tokens are read from, in order:
//!
//! ```bash
//! curl -H "Authorization: Bearer s3cret" http://localhost:8000/api/chats/
//! curl -H "X-API-Key: s3cret" http://localhost:8000/api/chats/
//! ```
//!
//! and looked up in the `API_CREDENTIALS` table. Every configured token is
//! compared in constant time, so the lookup takes the same time whichever entry
//! (if any) matches.
//!
//! # Outcomes
//!
//! - Valid token: the principal is inserted as a request extension
//! - No token: the request continues anonymously
//! - Unknown token: the failure is counted against the client IP and the
//!   request continues anonymously
//!
//! Whether an anonymous caller may proceed is decided later by role-based access.
//!
//! # Brute Force Protection
//!
//! Failed attempts are tracked per IP. Once an IP exceeds the failure budget,
//! further invalid attempts from it are answered with `429` until the budget
//! replenishes. Valid tokens are always accepted.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::{Choice, ConstantTimeEq};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::ClientIpExt;
use crate::error::Rejection;
use crate::models::Principal;

/// Header name for API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Maximum auth failures per IP per minute.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Burst capacity for auth failure tracking.
const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

/// Auth failure rate limiter (per IP).
type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Identity layer for the Tower middleware stack.
#[derive(Clone)]
pub struct IdentityLayer {
    credentials: Arc<Vec<(String, Principal)>>,
    failure_limiter: Arc<AuthFailureLimiter>,
}

impl IdentityLayer {
    /// Create an identity layer over a token to principal table.
    pub fn new<I>(credentials: I) -> Self
    where
        I: IntoIterator<Item = (String, Principal)>,
    {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);

        Self {
            credentials: Arc::new(credentials.into_iter().collect()),
            failure_limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Number of configured tokens.
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Drop failure counters that have fully replenished.
    pub fn retain_recent(&self) {
        self.failure_limiter.retain_recent();
    }
}

impl<S> Layer<S> for IdentityLayer {
    type Service = IdentityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdentityService {
            inner,
            credentials: self.credentials.clone(),
            failure_limiter: self.failure_limiter.clone(),
        }
    }
}

/// Identity service wrapper.
#[derive(Clone)]
pub struct IdentityService<S> {
    inner: S,
    credentials: Arc<Vec<(String, Principal)>>,
    failure_limiter: Arc<AuthFailureLimiter>,
}

impl<S> Service<Request<Body>> for IdentityService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let credentials = self.credentials.clone();
        let failure_limiter = self.failure_limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(token) = extract_token(&req) else {
                return inner.call(req).await;
            };

            if let Some(principal) = lookup(&credentials, &token) {
                debug!(
                    user_id = principal.id,
                    role = %principal.role,
                    "Authenticated request"
                );
                req.extensions_mut().insert(principal);
                return inner.call(req).await;
            }

            let client_ip = req.client_ip().into_owned();

            if let Err(not_until) = failure_limiter.check_key(&client_ip) {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after = wait_time.as_secs().max(1);

                error!(
                    client_ip = %client_ip,
                    retry_after_secs = retry_after,
                    "IP throttled due to excessive auth failures"
                );

                return Ok(Rejection::AuthThrottled { retry_after }.into_response());
            }

            warn!(
                path = %req.uri().path(),
                client_ip = %client_ip,
                "Invalid credentials, continuing anonymously"
            );
            inner.call(req).await
        })
    }
}

/// Extract a credential token from the request.
///
/// Checks `Authorization: Bearer <token>` first, then `X-API-Key`.
fn extract_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(header_value) = req.headers().get(AUTHORIZATION)
        && let Ok(value) = header_value.to_str()
        && let Some((scheme, token)) = value.trim().split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
        && !token.trim().is_empty()
    {
        return Some(token.trim().to_string());
    }

    if let Some(header_value) = req.headers().get(API_KEY_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.trim().is_empty()
    {
        return Some(value.trim().to_string());
    }

    None
}

/// Find the principal for a token, comparing against every entry.
fn lookup(credentials: &[(String, Principal)], token: &str) -> Option<Principal> {
    let mut found: Option<&Principal> = None;

    for (candidate, principal) in credentials {
        let matched: Choice = candidate.as_bytes().ct_eq(token.as_bytes());
        if bool::from(matched) && found.is_none() {
            found = Some(principal);
        }
    }

    found.cloned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn layer() -> IdentityLayer {
        IdentityLayer::new([
            ("alice-token".to_string(), Principal::new(1, "alice", "admin")),
            ("bob-token".to_string(), Principal::new(2, "bob", "user")),
        ])
    }

    async fn echo_principal(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let name = req
            .extensions()
            .get::<Principal>()
            .map(|p| p.username.clone())
            .unwrap_or_else(|| "anonymous".to_string());
        Ok(Response::new(Body::from(name)))
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_extract_bearer_token() {
        let req = Request::builder()
            .header("authorization", "Bearer abc123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_token(&req).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_api_key_header() {
        let req = Request::builder()
            .header("x-api-key", "key-1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_token(&req).as_deref(), Some("key-1"));
    }

    #[test]
    fn test_extract_ignores_other_schemes() {
        let req = Request::builder()
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();

        assert!(extract_token(&req).is_none());
    }

    #[test]
    fn test_lookup() {
        let layer = layer();

        assert_eq!(lookup(&layer.credentials, "bob-token").unwrap().id, 2);
        assert!(lookup(&layer.credentials, "bob-tokeN").is_none());
        assert!(lookup(&layer.credentials, "").is_none());
        assert_eq!(layer.credential_count(), 2);
    }

    #[tokio::test]
    async fn test_valid_token_sets_principal() {
        let service = layer().layer(tower::service_fn(echo_principal));
        let req = Request::builder()
            .header("authorization", "Bearer alice-token")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(body_text(response).await, "alice");
    }

    #[tokio::test]
    async fn test_missing_token_is_anonymous() {
        let service = layer().layer(tower::service_fn(echo_principal));
        let req = Request::builder().body(Body::empty()).unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(body_text(response).await, "anonymous");
    }

    #[tokio::test]
    async fn test_repeated_failures_are_throttled() {
        let layer = layer();
        let mut statuses = Vec::new();

        for _ in 0..8 {
            let service = layer.layer(tower::service_fn(echo_principal));
            let req = Request::builder()
                .header("x-api-key", "wrong")
                .header("x-forwarded-for", "198.51.100.7")
                .body(Body::empty())
                .unwrap();
            statuses.push(service.oneshot(req).await.unwrap().status());
        }

        assert_eq!(statuses[0], StatusCode::OK);
        assert_eq!(statuses[7], StatusCode::TOO_MANY_REQUESTS);

        // A valid token from the same IP still passes
        let service = layer.layer(tower::service_fn(echo_principal));
        let req = Request::builder()
            .header("x-api-key", "bob-token")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "bob");
    }
}
