//! Application routing with the request pipeline.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Answers preflight requests
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Security headers │ ← Added to every response
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Request context  │ ← X-Request-Id, client IP
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Identity      │ ← Principal from credentials, 429 on brute force
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Request logging  │ ← request/response events, X-Processing-Time
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   IP blocking    │ ← 403
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate limiting   │ ← 429
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ JSON validation  │ ← 400 / 413
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Role access    │ ← 401 / 403
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Maintenance    │ ← 503
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! Layers are added innermost first, since each `.layer()` call wraps the
//! router built so far.
//!
//! # Routes
//!
//! - `GET /api/health/` - Health check (public)
//! - `GET|PUT /api/admin/maintenance` - Maintenance switch
//! - anything else - Echo of what the pipeline attached to the request

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::AppResult;
use crate::handlers;
use crate::middleware::{
    IpBlockLayer, JsonValidationLayer, MaintenanceLayer, RateLimitLayer, RequestContextLayer,
    RequestLoggingLayer, RoleAccessLayer, TrustedProxyConfig, add_security_headers,
};
use crate::state::AppState;
use crate::validation::ValidationRules;

/// Build the application router with all routes and middleware configured.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if a suspicious header rule is invalid.
pub fn build_router(state: AppState) -> AppResult<Router> {
    let config = state.config.clone();

    let router = Router::new()
        .route("/api/health/", get(handlers::health_check))
        .route(
            "/api/admin/maintenance",
            get(handlers::get_maintenance).put(handlers::set_maintenance),
        )
        .fallback(handlers::echo)
        .with_state(state.clone());

    let ip_block = IpBlockLayer::from_config(&config, state.bans.clone())?;
    let trusted_proxies = TrustedProxyConfig::new(&config.trusted_proxies);

    info!(
        banned_ips = config.banned_ips.len(),
        suspicious_headers = config.suspicious_headers.len(),
        credentials = state.identity.credential_count(),
        maintenance = state.maintenance.is_enabled(),
        trusted_proxies = trusted_proxies.is_enabled(),
        "Request pipeline configured"
    );

    let router = router
        .layer(MaintenanceLayer::new(
            state.maintenance.clone(),
            &config.maintenance_eta,
        ))
        .layer(RoleAccessLayer::new(config.role_access.clone()))
        .layer(JsonValidationLayer::new(
            ValidationRules::default(),
            config.max_json_body_size,
        ))
        .layer(RateLimitLayer::new(state.rate_limits.clone()))
        .layer(ip_block)
        .layer(RequestLoggingLayer::new(config.slow_request_threshold))
        .layer(state.identity.clone())
        .layer(RequestContextLayer::new(trusted_proxies))
        .layer(axum::middleware::from_fn(add_security_headers))
        .layer(build_cors_layer(&config.cors_allowed_origins));

    Ok(router)
}

/// Build CORS layer from configuration.
///
/// `*` anywhere in the list allows any origin; otherwise unparseable origins
/// are skipped.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
