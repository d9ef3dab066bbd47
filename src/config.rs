//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! Structured settings (`RATE_LIMITS`, `ROLE_ACCESS_CONFIG`, `SUSPICIOUS_HEADERS`,
//! `API_CREDENTIALS`) are given as JSON documents:
//!
//! ```bash
//! BANNED_IPS=203.0.113.7,198.51.100.0/24
//! RATE_LIMITS='{"default":{"requests":100,"window":3600},"auth":{"requests":5,"window":300}}'
//! ROLE_ACCESS_CONFIG='{"user":{"allowed_paths":["/api/chats/"],"allowed_methods":["GET"]}}'
//! SUSPICIOUS_HEADERS='{"user-agent":"(bot|crawler|scanner|sqlmap|nmap)"}'
//! API_CREDENTIALS='{"s3cret":{"id":1,"username":"alice","role":"admin"}}'
//! MAINTENANCE_MODE=false
//! ```
//!
//! # Pipeline Settings
//!
//! - `BANNED_IPS`: Comma-separated IPs or CIDR ranges rejected outright
//! - `RATE_LIMITS`: Request budgets per limit type (`default`, `auth`, `messages`, `api`)
//! - `ROLE_ACCESS_CONFIG`: Role to path/method policy, least privileged role first
//! - `MAINTENANCE_MODE`: Start with maintenance mode switched on

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::access::RoleAccessConfig;
use crate::error::{AppError, AppResult};
use crate::middleware::ip::CidrRange;
use crate::models::Principal;

/// Default maximum JSON request body (10 MiB).
pub const DEFAULT_MAX_JSON_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Longest temporary ban accepted in `TEMP_BAN_SECS` (one year).
pub const MAX_TEMP_BAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default pattern applied to the `User-Agent` header by IP blocking.
pub const DEFAULT_SUSPICIOUS_USER_AGENT_PATTERN: &str = r"(bot|crawler|scanner|sqlmap|nmap)";

// =============================================================================
// Rate Limit Rules
// =============================================================================

/// A request budget: `requests` per `window` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests admitted per window
    pub requests: u32,
    /// Window length in seconds
    pub window: u64,
}

impl RateLimitRule {
    pub const fn new(requests: u32, window: u64) -> Self {
        Self { requests, window }
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

/// Category a request is rate limited under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitType {
    Default,
    Auth,
    Messages,
    Api,
}

impl LimitType {
    pub const ALL: [LimitType; 4] = [
        LimitType::Default,
        LimitType::Auth,
        LimitType::Messages,
        LimitType::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Default => "default",
            LimitType::Auth => "auth",
            LimitType::Messages => "messages",
            LimitType::Api => "api",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_rule() -> RateLimitRule {
    RateLimitRule::new(100, 3600)
}

/// Rate limit rules per [`LimitType`].
///
/// A limit type without its own rule falls back to `default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default = "default_rule")]
    pub default: RateLimitRule,
    #[serde(default)]
    pub auth: Option<RateLimitRule>,
    #[serde(default)]
    pub messages: Option<RateLimitRule>,
    #[serde(default)]
    pub api: Option<RateLimitRule>,
}

impl RateLimits {
    /// Rule applied to a limit type.
    pub fn rule(&self, limit_type: LimitType) -> RateLimitRule {
        let specific = match limit_type {
            LimitType::Default => None,
            LimitType::Auth => self.auth,
            LimitType::Messages => self.messages,
            LimitType::Api => self.api,
        };
        specific.unwrap_or(self.default)
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            default: default_rule(),
            auth: Some(RateLimitRule::new(5, 300)),
            messages: Some(RateLimitRule::new(10, 60)),
            api: Some(RateLimitRule::new(1000, 3600)),
        }
    }
}

// =============================================================================
// Log Format
// =============================================================================

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` (`pretty` or `json`); anything else means pretty.
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8000)
    pub port: u16,

    // =========================================================================
    // IP Blocking Configuration
    // =========================================================================
    /// IP addresses or CIDR ranges that are always rejected
    pub banned_ips: Vec<String>,

    /// Header name to case-insensitive regex; a match bans the client temporarily
    pub suspicious_headers: Vec<(String, String)>,

    /// How long a temporary ban lasts (default: 1 hour)
    pub temp_ban_duration: Duration,

    /// How often expired bans and idle rate limiter keys are purged (default: 60s)
    pub ban_sweep_interval: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Request budgets per limit type
    pub rate_limits: RateLimits,

    // =========================================================================
    // Access Control Configuration
    // =========================================================================
    /// Role to path/method policy
    pub role_access: RoleAccessConfig,

    /// Credential token to principal
    pub credentials: HashMap<String, Principal>,

    // =========================================================================
    // Maintenance Configuration
    // =========================================================================
    /// Whether the service starts in maintenance mode
    pub maintenance_mode: bool,

    /// Recovery estimate reported to clients during maintenance
    pub maintenance_eta: String,

    // =========================================================================
    // Request Limits Configuration
    // =========================================================================
    /// Maximum JSON request body size in bytes (default: 10MB)
    pub max_json_body_size: usize,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges. When set, forwarding headers are only
    /// honoured for connections from these networks.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Tracing output format
    pub log_format: LogFormat,

    /// Requests slower than this are logged as warnings (default: 2s)
    pub slow_request_threshold: Duration,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, malformed JSON, uncompilable pattern).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8000)?,

            // IP blocking
            banned_ips: Self::parse_list("BANNED_IPS", ""),
            suspicious_headers: Self::parse_suspicious_headers()?,
            temp_ban_duration: Duration::from_secs(Self::parse_env("TEMP_BAN_SECS", 3600)?),
            ban_sweep_interval: Duration::from_secs(Self::parse_env(
                "BAN_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Rate limiting
            rate_limits: Self::parse_json_env("RATE_LIMITS")?.unwrap_or_default(),

            // Access control
            role_access: match env::var("ROLE_ACCESS_CONFIG") {
                Ok(raw) if !raw.trim().is_empty() => RoleAccessConfig::with_overrides(&raw)
                    .map_err(|e| AppError::ConfigError(format!("Invalid ROLE_ACCESS_CONFIG: {e}")))?,
                _ => RoleAccessConfig::default(),
            },
            credentials: Self::parse_json_env("API_CREDENTIALS")?.unwrap_or_default(),

            // Maintenance
            maintenance_mode: Self::parse_bool_env("MAINTENANCE_MODE", false)?,
            maintenance_eta: env::var("MAINTENANCE_ETA")
                .unwrap_or_else(|_| "30 minutes".to_string()),

            // Request limits
            max_json_body_size: Self::parse_env("MAX_JSON_BODY_SIZE", DEFAULT_MAX_JSON_BODY_SIZE)?,

            // Security
            cors_allowed_origins: Self::parse_list(
                "CORS_ALLOWED_ORIGINS",
                "http://localhost:3000,http://127.0.0.1:3000",
            ),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: LogFormat::from_env(),
            slow_request_threshold: Duration::from_millis(Self::parse_env(
                "SLOW_REQUEST_THRESHOLD_MS",
                2000,
            )?),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        for limit_type in LimitType::ALL {
            let rule = self.rate_limits.rule(limit_type);
            if rule.requests == 0 || rule.window == 0 {
                return Err(AppError::ConfigError(format!(
                    "RATE_LIMITS.{limit_type} must have requests > 0 and window > 0"
                )));
            }
        }

        if self.max_json_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_JSON_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.temp_ban_duration.is_zero() {
            return Err(AppError::ConfigError(
                "TEMP_BAN_SECS must be greater than 0".to_string(),
            ));
        }

        if self.temp_ban_duration > MAX_TEMP_BAN {
            return Err(AppError::ConfigError(format!(
                "TEMP_BAN_SECS must be at most {}",
                MAX_TEMP_BAN.as_secs()
            )));
        }

        if self.ban_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "BAN_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        for (header, pattern) in &self.suspicious_headers {
            if axum::http::HeaderName::try_from(header.as_str()).is_err() {
                return Err(AppError::ConfigError(format!(
                    "SUSPICIOUS_HEADERS contains invalid header name '{header}'"
                )));
            }
            if let Err(e) = Regex::new(pattern) {
                return Err(AppError::ConfigError(format!(
                    "SUSPICIOUS_HEADERS pattern for '{header}' is invalid: {e}"
                )));
            }
        }

        for entry in &self.banned_ips {
            if entry.contains('/') && CidrRange::parse(entry).is_none() {
                return Err(AppError::ConfigError(format!(
                    "BANNED_IPS contains invalid CIDR range '{entry}'"
                )));
            }
        }

        if self.role_access.is_empty() {
            return Err(AppError::ConfigError(
                "ROLE_ACCESS_CONFIG must define at least one role".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a boolean flag. Accepts true/false, 1/0, yes/no, on/off.
    fn parse_bool_env(name: &str, default: bool) -> AppResult<bool> {
        match env::var(name) {
            Ok(val) => parse_flag(&val)
                .ok_or_else(|| AppError::ConfigError(format!("Invalid {name}: '{val}'"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a JSON-valued environment variable. Unset or blank yields `None`.
    fn parse_json_env<T>(name: &str) -> AppResult<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        match env::var(name) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            _ => Ok(None),
        }
    }

    /// Parse a comma-separated list, dropping blank entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }

    /// Parse `SUSPICIOUS_HEADERS`, keeping declaration order.
    fn parse_suspicious_headers() -> AppResult<Vec<(String, String)>> {
        let parsed: Option<serde_json::Map<String, serde_json::Value>> =
            Self::parse_json_env("SUSPICIOUS_HEADERS")?;

        match parsed {
            None => Ok(default_suspicious_headers()),
            Some(map) => map
                .into_iter()
                .map(|(header, pattern)| match pattern {
                    serde_json::Value::String(p) => Ok((header.to_ascii_lowercase(), p)),
                    other => Err(AppError::ConfigError(format!(
                        "SUSPICIOUS_HEADERS pattern for '{header}' must be a string, got {other}"
                    ))),
                })
                .collect(),
        }
    }
}

fn default_suspicious_headers() -> Vec<(String, String)> {
    vec![(
        "user-agent".to_string(),
        DEFAULT_SUSPICIOUS_USER_AGENT_PATTERN.to_string(),
    )]
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8000,
            // IP blocking
            banned_ips: vec![],
            suspicious_headers: default_suspicious_headers(),
            temp_ban_duration: Duration::from_secs(3600),
            ban_sweep_interval: Duration::from_secs(60),
            // Rate limiting
            rate_limits: RateLimits::default(),
            // Access control
            role_access: RoleAccessConfig::default(),
            credentials: HashMap::new(),
            // Maintenance
            maintenance_mode: false,
            maintenance_eta: "30 minutes".to_string(),
            // Request limits
            max_json_body_size: DEFAULT_MAX_JSON_BODY_SIZE,
            // Security
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            trusted_proxies: vec![],
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            slow_request_threshold: Duration::from_secs(2),
            metrics_port: 9090,
        }
    }
}
