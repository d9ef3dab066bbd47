//! End-to-end tests of the assembled pipeline, driven in-process.
//!
//! Each test builds its own router and state, so rate limit budgets and bans
//! never leak between tests. Requests carry `X-Forwarded-For` to pick the
//! client address, since there is no TCP peer in `oneshot` calls.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use tower::ServiceExt;

use api_guard::models::Principal;
use api_guard::{AppState, Config, build_router};

const ADMIN_TOKEN: &str = "admin-token";
const MODERATOR_TOKEN: &str = "moderator-token";
const USER_TOKEN: &str = "user-token";

fn test_config() -> Config {
    let mut config = Config::default();
    config.credentials.insert(
        ADMIN_TOKEN.to_string(),
        Principal::new(1, "alice", "admin").with_email("alice@example.com"),
    );
    config.credentials.insert(
        MODERATOR_TOKEN.to_string(),
        Principal::new(2, "mallory", "moderator"),
    );
    config.credentials.insert(
        USER_TOKEN.to_string(),
        Principal::new(3, "bob", "user").with_email("bob@example.com"),
    );
    config
}

fn app_with(config: Config) -> (Router, AppState) {
    let state = AppState::new(config).unwrap();
    let router = build_router(state.clone()).unwrap();
    (router, state)
}

fn app() -> Router {
    app_with(test_config()).0
}

fn request(method: Method, uri: &str, token: Option<&str>) -> axum::http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.23")
        .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
}

fn json_request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    request(method, uri, token)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn assert_security_headers(response: &Response) {
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-xss-protection"], "1; mode=block");
    assert_eq!(
        headers["strict-transport-security"],
        "max-age=31536000; includeSubDomains"
    );
    assert_eq!(
        headers["referrer-policy"],
        "strict-origin-when-cross-origin"
    );
    assert_eq!(
        headers["content-security-policy"],
        "default-src 'self'; script-src 'self' 'unsafe-inline'; \
         style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; \
         connect-src 'self'; font-src 'self'; object-src 'none'; \
         media-src 'self'; frame-src 'none'; base-uri 'self';"
    );
}

// =============================================================================
// Health and Ambient Headers
// =============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let app = app();
    let before = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();

    let response = send(
        &app,
        request(Method::GET, "/api/health/", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_security_headers(&response);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-processing-time"));
    assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "999");

    let reset: u64 = response.headers()["x-ratelimit-reset"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(reset >= before);
    assert!(reset <= before + 3600 + 1);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["maintenance"], false);
}

#[tokio::test]
async fn test_request_id_propagated() {
    let app = app();

    let response = send(
        &app,
        request(Method::GET, "/api/chats/", Some(USER_TOKEN))
            .header("x-request-id", "trace-me-42")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.headers()["x-request-id"], "trace-me-42");
    let body = body_json(response).await;
    assert_eq!(body["request_id"], "trace-me-42");
}

#[tokio::test]
async fn test_cors_preflight() {
    let app = app();

    let response = send(
        &app,
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/chats/")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:3000"
    );
}

// =============================================================================
// Role-Based Access
// =============================================================================

#[tokio::test]
async fn test_anonymous_needs_authentication() {
    let app = app();

    let response = send(
        &app,
        request(Method::GET, "/api/chats/", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_security_headers(&response);
    let body = body_json(response).await;
    assert_eq!(body["code"], "authentication_required");
}

#[tokio::test]
async fn test_invalid_token_is_anonymous() {
    let app = app();

    let response = send(
        &app,
        request(Method::GET, "/api/chats/", Some("not-a-token"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_user_reaches_allowed_path() {
    let app = app();

    let response = send(
        &app,
        request(Method::GET, "/api/chats/7/", Some(USER_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/api/chats/7/");
    assert_eq!(body["user"]["username"], "bob");
    assert_eq!(body["user"]["role"], "user");
}

#[tokio::test]
async fn test_user_cannot_delete() {
    let app = app();

    let response = send(
        &app,
        request(Method::DELETE, "/api/chats/7/", Some(USER_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Insufficient permissions for this action");
    assert_eq!(body["required_role"], "admin");
    assert_eq!(body["current_role"], "user");
}

#[tokio::test]
async fn test_moderator_denied_delete_admin_allowed() {
    let app = app();

    let response = send(
        &app,
        request(Method::DELETE, "/api/users/4/", Some(MODERATOR_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &app,
        request(Method::DELETE, "/api/users/4/", Some(ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// IP Blocking
// =============================================================================

#[tokio::test]
async fn test_banned_ip_rejected() {
    let mut config = test_config();
    config.banned_ips = vec!["198.51.100.23".to_string()];
    let (app, _) = app_with(config);

    let response = send(
        &app,
        request(Method::GET, "/api/health/", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_security_headers(&response);
    let body = body_json(response).await;
    assert_eq!(body, json!({"error": "Access denied", "code": "ip_blocked"}));
}

#[tokio::test]
async fn test_suspicious_header_bans_ip() {
    let (app, state) = app_with(test_config());

    let response = send(
        &app,
        Request::builder()
            .uri("/api/health/")
            .header("x-forwarded-for", "192.0.2.99")
            .header("user-agent", "sqlmap/1.7")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "suspicious_headers");
    assert!(state.bans.is_banned("192.0.2.99"));

    let response = send(
        &app,
        Request::builder()
            .uri("/api/health/")
            .header("x-forwarded-for", "192.0.2.99")
            .header("user-agent", "Mozilla/5.0")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body_json(response).await["code"], "ip_blocked");
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test]
async fn test_auth_endpoint_rate_limited() {
    let app = app();
    let credentials = json!({"email": "test@example.com", "password": "password"});

    for _ in 0..5 {
        let response = send(
            &app,
            json_request(Method::POST, "/api/auth/login/", None, credentials.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(
        &app,
        json_request(Method::POST, "/api/auth/login/", None, credentials),
    )
    .await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

    let body = body_json(response).await;
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["limit_type"], "auth");
    assert_eq!(body["limits"], json!({"requests": 5, "window": 300}));
    assert!(body["retry_after"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_rate_limit_keyed_by_user() {
    let mut config = test_config();
    config.rate_limits.api = Some(api_guard::config::RateLimitRule::new(2, 60));
    let (app, _) = app_with(config);

    for _ in 0..2 {
        let response = send(
            &app,
            request(Method::GET, "/api/chats/", Some(USER_TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(
        &app,
        request(Method::GET, "/api/chats/", Some(USER_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Same IP, different user: separate budget
    let response = send(
        &app,
        request(Method::GET, "/api/chats/", Some(ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// JSON Validation
// =============================================================================

#[tokio::test]
async fn test_payload_cleaned_before_handler() {
    let app = app();

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/api/conversations/",
            Some(USER_TOKEN),
            json!({
                "group_name": "  Team  ",
                "is_group": "true",
                "participant_emails": ["a@example.com", "", null],
                "topic": null
            }),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["payload"],
        json!({
            "group_name": "Team",
            "is_group": true,
            "participant_emails": ["a@example.com"]
        })
    );
}

#[tokio::test]
async fn test_message_rules_enforced() {
    let app = app();

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/api/messages/",
            Some(USER_TOKEN),
            json!({"message_body": "hello", "message_type": "video"}),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "JSON validation failed");
}

#[tokio::test]
async fn test_malformed_json_rejected() {
    let app = app();

    let response = send(
        &app,
        request(Method::POST, "/api/chats/", Some(USER_TOKEN))
            .header("content-type", "application/json")
            .body(Body::from("{\"broken\": "))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid JSON format");
}

#[tokio::test]
async fn test_payload_too_large() {
    let mut config = test_config();
    config.max_json_body_size = 32;
    let (app, _) = app_with(config);

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/api/chats/",
            Some(USER_TOKEN),
            json!({"text": "x".repeat(100)}),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["max_size"], "32 bytes");
}

// =============================================================================
// Maintenance Mode
// =============================================================================

#[tokio::test]
async fn test_maintenance_mode_lifecycle() {
    let mut config = test_config();
    config.maintenance_mode = true;
    config.maintenance_eta = "2 hours".to_string();
    let (app, state) = app_with(config);

    // Regular users are turned away
    let response = send(
        &app,
        request(Method::GET, "/api/chats/", Some(USER_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await,
        json!({
            "error": "Service temporarily unavailable for maintenance",
            "estimated_recovery_time": "2 hours"
        })
    );

    // Health stays up
    let response = send(
        &app,
        request(Method::GET, "/api/health/", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["maintenance"], true);

    // Admin switches maintenance off
    let response = send(
        &app,
        json_request(
            Method::PUT,
            "/api/admin/maintenance",
            Some(ADMIN_TOKEN),
            json!({"enabled": false}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["enabled"], false);
    assert!(!state.maintenance.is_enabled());

    let response = send(
        &app,
        request(Method::GET, "/api/chats/", Some(USER_TOKEN))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_maintenance_update_requires_boolean() {
    let app = app();

    let response = send(
        &app,
        json_request(
            Method::PUT,
            "/api/admin/maintenance",
            Some(ADMIN_TOKEN),
            json!({"enabled": "soon"}),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_user_cannot_toggle_maintenance() {
    let app = app();

    let response = send(
        &app,
        json_request(
            Method::PUT,
            "/api/admin/maintenance",
            Some(USER_TOKEN),
            json!({"enabled": true}),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
