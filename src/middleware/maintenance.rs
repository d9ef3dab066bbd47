//! Maintenance mode.
//!
//! While the [`MaintenanceSwitch`] is on, every request is answered with `503`
//! except the health endpoint, the admin index, and callers with an admin
//! role. The switch is shared with the admin handlers so it can be flipped at
//! runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, info};

use crate::error::Rejection;
use crate::metrics;
use crate::models::Principal;

/// Paths served even in maintenance mode (exact match).
pub const MAINTENANCE_EXEMPT_PATHS: [&str; 2] = ["/api/health/", "/admin/"];

/// Runtime maintenance flag.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceSwitch {
    enabled: Arc<AtomicBool>,
}

impl MaintenanceSwitch {
    pub fn new(enabled: bool) -> Self {
        metrics::set_maintenance_mode(enabled);
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Set the flag, returning the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        let previous = self.enabled.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            info!(enabled, "Maintenance mode changed");
            metrics::set_maintenance_mode(enabled);
        }
        previous
    }
}

/// Whether a request may bypass maintenance mode.
pub fn is_exempt(path: &str, principal: Option<&Principal>) -> bool {
    MAINTENANCE_EXEMPT_PATHS.contains(&path) || principal.is_some_and(Principal::is_admin)
}

/// Maintenance mode layer.
#[derive(Clone)]
pub struct MaintenanceLayer {
    switch: MaintenanceSwitch,
    estimated_recovery_time: Arc<str>,
}

impl MaintenanceLayer {
    pub fn new(switch: MaintenanceSwitch, estimated_recovery_time: &str) -> Self {
        Self {
            switch,
            estimated_recovery_time: Arc::from(estimated_recovery_time),
        }
    }
}

impl<S> Layer<S> for MaintenanceLayer {
    type Service = MaintenanceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaintenanceService {
            inner,
            switch: self.switch.clone(),
            estimated_recovery_time: self.estimated_recovery_time.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MaintenanceService<S> {
    inner: S,
    switch: MaintenanceSwitch,
    estimated_recovery_time: Arc<str>,
}

impl<S> Service<Request<Body>> for MaintenanceService<S>
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
        let blocked = self.switch.is_enabled()
            && !is_exempt(req.uri().path(), req.extensions().get::<Principal>());
        let estimated_recovery_time = self.estimated_recovery_time.to_string();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if blocked {
                debug!(path = %req.uri().path(), "Rejected during maintenance");
                return Ok(Rejection::Maintenance {
                    estimated_recovery_time,
                }
                .into_response());
            }
            inner.call(req).await
        })
    }
}
