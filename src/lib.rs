//! # api_guard
//!
//! An ordered HTTP middleware pipeline for Axum, guarding a JSON API with:
//!
//! - **CORS** and **security headers** on every response
//! - **Request logging** with per-request IDs and slow request warnings
//! - **IP blocking**: static block list, temporary bans, scanner detection
//! - **Rate limiting** per caller and endpoint category
//! - **JSON validation**: size limit, cleaning, per-endpoint field rules
//! - **Role-based access** from a configurable role policy table
//! - **Maintenance mode** switchable at runtime
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CORS → Security headers → Context → Identity → Logging     │
//! │  → IP blocking → Rate limiting → JSON validation            │
//! │  → Role access → Maintenance                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, maintenance switch, echo fallback)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use api_guard::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state)?;
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! BANNED_IPS=203.0.113.7 \
//! RATE_LIMITS='{"auth":{"requests":5,"window":300}}' \
//! MAINTENANCE_MODE=false cargo run
//! ```

pub mod access;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult, Rejection};
pub use routes::build_router;
pub use state::AppState;
