//! Request context: correlation ID and client address.
//!
//! # Features
//!
//! - Propagates an incoming `X-Request-Id` header or generates a UUIDv4
//! - Stores the ID as a [`RequestId`] extension and echoes it on the response
//! - Resolves the client address once and stores it as a [`ClientIp`] extension
//!
//! Clients can provide their own request ID:
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8000/api/health/
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

use super::ip::{ClientIp, TrustedProxyConfig, resolve_client_ip};

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied request ID that is propagated as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Correlation ID of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Layer that attaches [`RequestId`] and [`ClientIp`] to every request.
#[derive(Clone, Default)]
pub struct RequestContextLayer {
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RequestContextLayer {
    pub fn new(trusted_proxies: TrustedProxyConfig) -> Self {
        Self {
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for RequestContextLayer {
    type Service = RequestContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestContextService {
            inner,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestContextService<S> {
    inner: S,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for RequestContextService<S>
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
        let request_id = extract_or_generate_request_id(&req);
        let client_ip = resolve_client_ip(&req, &self.trusted_proxies);

        Span::current().record("request_id", request_id.as_str());
        debug!(request_id = %request_id, client_ip = %client_ip.addr, "Processing request");

        let header_value = HeaderValue::from_str(&request_id)
            .unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone());
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        req.extensions_mut().insert(RequestId(request_id));
        req.extensions_mut().insert(client_ip);

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, header_value);
            Ok(response)
        })
    }
}

/// Extract request ID from headers or generate a new one.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> String {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
    {
        return value.to_string();
    }

    Uuid::new_v4().to_string()
}

/// Extension trait to read the request ID stored by [`RequestContextLayer`].
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions().get::<RequestId>().map(RequestId::as_str)
    }
}

/// Client address stored by [`RequestContextLayer`], if the layer ran.
pub fn stored_client_ip<B>(req: &Request<B>) -> Option<&ClientIp> {
    req.extensions().get::<ClientIp>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[test]
    fn test_extract_existing_request_id() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_or_generate_request_id(&req), "existing-id-123");
    }

    #[test]
    fn test_generate_new_request_id() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_oversized_request_id_replaced() {
        let req = Request::builder()
            .header("x-request-id", "x".repeat(MAX_REQUEST_ID_LEN + 1))
            .body(Body::empty())
            .unwrap();

        let id = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_layer_stores_context_and_echoes_id() {
        let service = RequestContextLayer::default().layer(tower::service_fn(
            |req: Request<Body>| async move {
                let id = req.request_id().unwrap_or_default().to_string();
                let ip = stored_client_ip(&req)
                    .map(|ip| ip.addr.clone())
                    .unwrap_or_default();
                Ok::<_, Infallible>(Response::new(Body::from(format!("{id}|{ip}"))))
            },
        ));

        let req = Request::builder()
            .header("x-request-id", "corr-1")
            .header("x-forwarded-for", "203.0.113.5")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "corr-1");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"corr-1|203.0.113.5");
    }
}
