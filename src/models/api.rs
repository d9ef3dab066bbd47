use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy" while the process serves requests
    pub status: String,
    pub message: String,
    /// Whether maintenance mode is switched on
    pub maintenance: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Current maintenance mode state.
#[derive(Debug, Serialize)]
pub struct MaintenanceStatus {
    pub enabled: bool,
    pub estimated_recovery_time: String,
}

/// Request to switch maintenance mode.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceUpdate {
    pub enabled: bool,
}

/// Summary of a request that reached the application.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    pub method: String,
    pub path: String,
    /// Caller as described in request logs
    pub user: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Cleaned JSON payload, when the request carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}
