use axum::http::StatusCode;
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{LimitType, RateLimitRule};
use crate::metrics;

/// Application-wide error types with appropriate HTTP status codes.
///
/// These cover failures of the service itself (startup, handlers). Requests
/// refused by a pipeline stage are reported through [`Rejection`] instead.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::SerializationError(e) => {
                let sanitized = sanitize_serde_error(e);
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(ErrorResponse {
                        error: "serialization_error".to_string(),
                        message: sanitized,
                    }),
                )
                    .into_response();
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// A request refused by one of the pipeline stages.
///
/// Each variant maps to the status code and JSON body clients see. Converting
/// a rejection into a response also counts it in the rejection metrics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("request from blocked IP")]
    IpBlocked,

    #[error("suspicious request headers")]
    SuspiciousHeaders,

    #[error("suspicious user agent")]
    SuspiciousUserAgent,

    #[error("too many failed authentication attempts")]
    AuthThrottled { retry_after: u64 },

    #[error("rate limit exceeded for {limit_type}")]
    RateLimited {
        limit_type: LimitType,
        retry_after: u64,
        rule: RateLimitRule,
    },

    #[error("payload larger than {max_size} bytes")]
    PayloadTooLarge { max_size: usize },

    #[error("unreadable request body: {0}")]
    UnreadableBody(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("JSON validation failed: {0}")]
    ValidationFailed(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("role {current_role} may not access this resource")]
    Forbidden {
        required_role: String,
        current_role: String,
    },

    #[error("service in maintenance")]
    Maintenance { estimated_recovery_time: String },
}

impl Rejection {
    /// Pipeline stage that produced the rejection (metrics label).
    pub fn stage(&self) -> &'static str {
        match self {
            Rejection::IpBlocked | Rejection::SuspiciousHeaders | Rejection::SuspiciousUserAgent => {
                "ip_blocking"
            }
            Rejection::AuthThrottled { .. } => "identity",
            Rejection::RateLimited { .. } => "rate_limiting",
            Rejection::PayloadTooLarge { .. }
            | Rejection::UnreadableBody(_)
            | Rejection::InvalidJson(_)
            | Rejection::ValidationFailed(_) => "json_validation",
            Rejection::AuthenticationRequired | Rejection::Forbidden { .. } => "role_access",
            Rejection::Maintenance { .. } => "maintenance",
        }
    }

    /// Machine-readable rejection code.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::IpBlocked => "ip_blocked",
            Rejection::SuspiciousHeaders => "suspicious_headers",
            Rejection::SuspiciousUserAgent => "suspicious_user_agent",
            Rejection::AuthThrottled { .. } => "auth_throttled",
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::PayloadTooLarge { .. } => "payload_too_large",
            Rejection::UnreadableBody(_) => "unreadable_body",
            Rejection::InvalidJson(_) => "invalid_json",
            Rejection::ValidationFailed(_) => "validation_failed",
            Rejection::AuthenticationRequired => "authentication_required",
            Rejection::Forbidden { .. } => "insufficient_permissions",
            Rejection::Maintenance { .. } => "maintenance",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::IpBlocked
            | Rejection::SuspiciousHeaders
            | Rejection::SuspiciousUserAgent
            | Rejection::Forbidden { .. } => StatusCode::FORBIDDEN,
            Rejection::AuthThrottled { .. } | Rejection::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Rejection::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::UnreadableBody(_)
            | Rejection::InvalidJson(_)
            | Rejection::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Rejection::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Rejection::Maintenance { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            Rejection::IpBlocked => json!({ "error": "Access denied", "code": "ip_blocked" }),
            Rejection::SuspiciousHeaders => json!({
                "error": "Suspicious activity detected",
                "code": "suspicious_headers",
            }),
            Rejection::SuspiciousUserAgent => {
                json!({ "error": "Access denied", "code": "suspicious_user_agent" })
            }
            Rejection::AuthThrottled { retry_after } => json!({
                "error": "Too many failed authentication attempts",
                "code": "auth_throttled",
                "retry_after": retry_after,
            }),
            Rejection::RateLimited {
                limit_type,
                retry_after,
                rule,
            } => json!({
                "error": "Rate limit exceeded",
                "limit_type": limit_type.as_str(),
                "retry_after": retry_after,
                "limits": rule,
            }),
            Rejection::PayloadTooLarge { max_size } => json!({
                "error": "Payload too large",
                "max_size": format!("{max_size} bytes"),
            }),
            Rejection::UnreadableBody(details) => json!({
                "error": "Unreadable request body",
                "details": details,
            }),
            Rejection::InvalidJson(details) => json!({
                "error": "Invalid JSON format",
                "details": details,
            }),
            Rejection::ValidationFailed(details) => json!({
                "error": "JSON validation failed",
                "details": details,
            }),
            Rejection::AuthenticationRequired => json!({
                "error": "Authentication required",
                "code": "authentication_required",
            }),
            Rejection::Forbidden {
                required_role,
                current_role,
            } => json!({
                "error": "Insufficient permissions for this action",
                "required_role": required_role,
                "current_role": current_role,
            }),
            Rejection::Maintenance {
                estimated_recovery_time,
            } => json!({
                "error": "Service temporarily unavailable for maintenance",
                "estimated_recovery_time": estimated_recovery_time,
            }),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        metrics::record_rejection(self.stage(), self.code());

        let mut response = (self.status(), axum::Json(self.body())).into_response();
        let headers = response.headers_mut();

        match &self {
            Rejection::AuthThrottled { retry_after } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after));
            }
            Rejection::RateLimited {
                retry_after, rule, ..
            } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after));
                headers.insert(
                    HeaderName::from_static("x-ratelimit-limit"),
                    HeaderValue::from(rule.requests),
                );
                headers.insert(
                    HeaderName::from_static("x-ratelimit-remaining"),
                    HeaderValue::from_static("0"),
                );
            }
            _ => {}
        }

        response
    }
}
