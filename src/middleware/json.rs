//! JSON body validation and cleaning.
//!
//! Applies to `POST`, `PUT` and `PATCH` requests whose content type is
//! `application/json` (parameters such as `charset` are ignored). Other
//! requests pass through untouched.
//!
//! For a matching request the body is read up to `MAX_JSON_BODY_SIZE` bytes,
//! parsed (an empty body counts as `{}`), cleaned of `null` and empty-string
//! values, and checked against the rules registered for its path and method.
//! The cleaned payload replaces the body and is also stored as a
//! [`ValidatedJson`] extension for handlers.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use axum::http::{Method, Request, Response};
use axum::response::IntoResponse;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::{Map, Value};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::Rejection;
use crate::validation::{ValidationRules, clean_and_validate};

/// Cleaned JSON payload of the current request.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJson(pub Value);

/// Whether the request carries a JSON body this stage should inspect.
pub fn is_json_request<B>(req: &Request<B>) -> bool {
    let method = req.method();
    if method != Method::POST && method != Method::PUT && method != Method::PATCH {
        return false;
    }

    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("application/json"))
}

fn declared_length<B>(req: &Request<B>) -> Option<usize> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// JSON validation layer.
#[derive(Clone)]
pub struct JsonValidationLayer {
    rules: Arc<ValidationRules>,
    max_body_size: usize,
}

impl JsonValidationLayer {
    pub fn new(rules: ValidationRules, max_body_size: usize) -> Self {
        Self {
            rules: Arc::new(rules),
            max_body_size,
        }
    }
}

impl<S> Layer<S> for JsonValidationLayer {
    type Service = JsonValidationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JsonValidationService {
            inner,
            rules: self.rules.clone(),
            max_body_size: self.max_body_size,
        }
    }
}

#[derive(Clone)]
pub struct JsonValidationService<S> {
    inner: S,
    rules: Arc<ValidationRules>,
    max_body_size: usize,
}

impl<S> Service<Request<Body>> for JsonValidationService<S>
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
        let rules = self.rules.clone();
        let max_body_size = self.max_body_size;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !is_json_request(&req) {
                return inner.call(req).await;
            }

            match validate_request(req, &rules, max_body_size).await {
                Ok(req) => inner.call(req).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

/// Read, clean and check a JSON request, returning it with the cleaned body.
async fn validate_request(
    req: Request<Body>,
    rules: &ValidationRules,
    max_body_size: usize,
) -> Result<Request<Body>, Rejection> {
    if declared_length(&req).is_some_and(|len| len > max_body_size) {
        warn!(path = %req.uri().path(), "Declared JSON body exceeds limit");
        return Err(Rejection::PayloadTooLarge {
            max_size: max_body_size,
        });
    }

    let (mut parts, body) = req.into_parts();

    let bytes = match Limited::new(body, max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!(path = %parts.uri.path(), "JSON body exceeds limit");
            return Err(Rejection::PayloadTooLarge {
                max_size: max_body_size,
            });
        }
        Err(e) => return Err(Rejection::UnreadableBody(e.to_string())),
    };

    let payload = parse_payload(&bytes)?;

    let field_rules = rules.for_endpoint(parts.uri.path(), &parts.method);
    let cleaned = clean_and_validate(payload, field_rules).map_err(|e| {
        warn!(path = %parts.uri.path(), error = %e, "JSON validation failed");
        Rejection::ValidationFailed(e.to_string())
    })?;

    let body = serde_json::to_vec(&cleaned).map_err(|e| Rejection::InvalidJson(e.to_string()))?;
    debug!(path = %parts.uri.path(), size = body.len(), "JSON payload validated");

    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    parts.extensions.insert(ValidatedJson(cleaned));

    Ok(Request::from_parts(parts, Body::from(body)))
}

fn parse_payload(bytes: &Bytes) -> Result<Value, Rejection> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }

    serde_json::from_slice(bytes).map_err(|e| Rejection::InvalidJson(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use tower::ServiceExt;

    /// Echo the stored payload (or "none") back as the response body.
    async fn echo(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let stored = req
            .extensions()
            .get::<ValidatedJson>()
            .map(|ValidatedJson(v)| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        Ok(Response::new(Body::from(stored)))
    }

    async fn send(
        method: Method,
        uri: &str,
        content_type: &str,
        body: &str,
        max: usize,
    ) -> (StatusCode, Value) {
        let layer = JsonValidationLayer::new(ValidationRules::default(), max);
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = layer
            .layer(tower::service_fn(echo))
            .oneshot(req)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn test_is_json_request() {
        let req = Request::builder()
            .method(Method::POST)
            .header("content-type", "application/json; charset=utf-8")
            .body(Body::empty())
            .unwrap();
        assert!(is_json_request(&req));

        let get = Request::builder()
            .header("content-type", "application/json")
            .body(Body::empty())
            .unwrap();
        assert!(!is_json_request(&get));

        let form = Request::builder()
            .method(Method::PUT)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::empty())
            .unwrap();
        assert!(!is_json_request(&form));
    }

    #[tokio::test]
    async fn test_payload_cleaned_and_stored() {
        let (status, value) = send(
            Method::POST,
            "/api/messages/",
            "application/json",
            r#"{"conversation":"c1","message_body":"  hi  ","note":null}"#,
            1024,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["message_body"], "hi");
        assert!(value.get("note").is_none());
    }

    #[tokio::test]
    async fn test_empty_body_becomes_object() {
        let (status, value) = send(Method::PATCH, "/api/chats/1/", "application/json", "", 1024).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let (status, value) =
            send(Method::POST, "/api/chats/", "application/json", "{oops", 1024).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"], "Invalid JSON format");
    }

    #[tokio::test]
    async fn test_rule_failure() {
        let (status, value) = send(
            Method::POST,
            "/api/messages/",
            "application/json",
            r#"{"message_body":"hello"}"#,
            1024,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"], "JSON validation failed");
        assert_eq!(value["details"], "Missing required field: conversation");
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let body = format!(r#"{{"data":"{}"}}"#, "x".repeat(64));
        let (status, value) = send(Method::POST, "/api/chats/", "application/json", &body, 16).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(value["max_size"], "16 bytes");
    }

    #[tokio::test]
    async fn test_non_json_passes_through() {
        let (status, _) = send(Method::POST, "/api/chats/", "text/plain", "{oops", 1024).await;
        assert_eq!(status, StatusCode::OK);
    }
}
