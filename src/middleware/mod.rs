//! HTTP middleware making up the request pipeline.
//!
//! # Architecture
//!
//! ```text
//! Request → CORS → Security headers → Context → Identity → Logging
//!         → IP blocking → Rate limiting → JSON validation → Role access
//!         → Maintenance → Handler
//!
//!   IP blocking      403 ip_blocked / suspicious_headers / suspicious_user_agent
//!   Identity         429 auth_throttled
//!   Rate limiting    429 + Retry-After
//!   JSON validation  400 / 413
//!   Role access      401 / 403
//!   Maintenance      503
//! ```
//!
//! Security headers and CORS sit outside every rejecting stage, so refusals
//! carry them too. Context and identity run before logging so each log line
//! names the request ID, client IP and user.

pub mod auth;
pub mod context;
pub mod ip;
pub mod ip_block;
pub mod json;
pub mod logging;
pub mod maintenance;
pub mod rate_limit;
pub mod rbac;
pub mod security_headers;

pub use auth::IdentityLayer;
pub use context::{REQUEST_ID_HEADER, RequestContextLayer, RequestId, RequestIdExt};
pub use ip::{ClientIp, ClientIpExt, TrustedProxyConfig, UNKNOWN_IP};
pub use ip_block::{BanList, BlockList, IpBlockLayer};
pub use json::{JsonValidationLayer, ValidatedJson};
pub use logging::RequestLoggingLayer;
pub use maintenance::{MaintenanceLayer, MaintenanceSwitch};
pub use rate_limit::{RateLimitLayer, RateLimitRegistry};
pub use rbac::RoleAccessLayer;
pub use security_headers::add_security_headers;
