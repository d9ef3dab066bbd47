//! Shared application state.
//!
//! Holds the configuration and the handles that middleware and handlers share:
//!
//! - **Ban list**: Temporary IP bans written by IP blocking
//! - **Maintenance switch**: Read by the maintenance stage, flipped by admin handlers
//! - **Rate limiters**: Per limit type keyed limiters
//! - **Identity**: Credential table and auth failure tracking
//!
//! # Structured Concurrency
//!
//! The housekeeping sweeper is managed using `tokio_util::task::TaskTracker`
//! and `CancellationToken`. Call `shutdown()` to stop it before exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::AppResult;
use crate::middleware::{BanList, IdentityLayer, MaintenanceSwitch, RateLimitRegistry};

/// Shared application state for Axum handlers and middleware.
///
/// Cloned per request; all internal data is behind `Arc`.
///
/// # Lifecycle
///
/// The sweeper is spawned when the state is created, so construction needs a
/// Tokio runtime:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Temporary IP bans
    pub bans: BanList,
    /// Runtime maintenance flag
    pub maintenance: MaintenanceSwitch,
    /// Rate limiters per limit type
    pub rate_limits: Arc<RateLimitRegistry>,
    /// Credential lookup and auth failure tracking
    pub identity: IdentityLayer,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create application state and start the housekeeping sweeper.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the rate limit rules are invalid.
    pub fn new(config: Config) -> AppResult<Self> {
        let rate_limits = Arc::new(RateLimitRegistry::new(&config.rate_limits)?);
        let identity = IdentityLayer::new(
            config
                .credentials
                .iter()
                .map(|(token, principal)| (token.clone(), principal.clone())),
        );

        let state = Self {
            bans: BanList::new(),
            maintenance: MaintenanceSwitch::new(config.maintenance_mode),
            rate_limits,
            identity,
            started_at: Instant::now(),
            config: Arc::new(config),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweeper_task();

        Ok(state)
    }

    /// Spawn the periodic sweeper.
    ///
    /// Each tick purges expired bans and drops limiter keys whose budget has
    /// fully replenished.
    fn spawn_sweeper_task(&self) {
        let bans = self.bans.clone();
        let rate_limits = self.rate_limits.clone();
        let identity = self.identity.clone();
        let period = self.config.ban_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Sweeper task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = bans.purge_expired();
                        rate_limits.retain_recent();
                        identity.retain_recent();
                        trace!(
                            purged_bans = purged,
                            active_bans = bans.len(),
                            tracked_keys = rate_limits.len(),
                            "Sweep completed"
                        );
                    }
                }
            }

            debug!("Sweeper task shutting down");
        });
    }

    /// Gracefully shutdown background tasks.
    ///
    /// Cancels the sweeper, closes the tracker, and waits for completion.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Principal;
    use std::time::Duration;

    #[tokio::test]
    async fn test_state_creation_and_shutdown() {
        let mut config = Config::default();
        config.maintenance_mode = true;
        config
            .credentials
            .insert("tok".to_string(), Principal::new(1, "ivy", "admin"));

        let state = AppState::new(config).unwrap();
        assert!(state.maintenance.is_enabled());
        assert_eq!(state.identity.credential_count(), 1);
        assert!(state.bans.is_empty());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_bans() {
        let config = Config {
            ban_sweep_interval: Duration::from_millis(20),
            ..Config::default()
        };
        let state = AppState::new(config).unwrap();

        state.bans.ban("10.9.8.7", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.bans.len(), 0);

        state.shutdown().await;
    }
}
