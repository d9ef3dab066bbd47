//! Role-based access control.
//!
//! Public endpoints (login, registration, token refresh, admin login, health)
//! are always let through. Every other request needs a [`Principal`] whose role
//! policy permits the path and method.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::access::{RoleAccessConfig, is_public_endpoint};
use crate::error::Rejection;
use crate::models::Principal;

/// Decide whether a request may proceed.
pub fn authorize(
    config: &RoleAccessConfig,
    principal: Option<&Principal>,
    path: &str,
    method: &str,
) -> Result<(), Rejection> {
    if is_public_endpoint(path) {
        return Ok(());
    }

    let Some(principal) = principal else {
        return Err(Rejection::AuthenticationRequired);
    };

    if config.has_access(&principal.role, path, method) {
        return Ok(());
    }

    Err(Rejection::Forbidden {
        required_role: config.required_role(path, method).to_string(),
        current_role: principal.role.clone(),
    })
}

/// Role-based access layer.
#[derive(Clone)]
pub struct RoleAccessLayer {
    config: Arc<RoleAccessConfig>,
}

impl RoleAccessLayer {
    pub fn new(config: RoleAccessConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RoleAccessLayer {
    type Service = RoleAccessService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RoleAccessService {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RoleAccessService<S> {
    inner: S,
    config: Arc<RoleAccessConfig>,
}

impl<S> Service<Request<Body>> for RoleAccessService<S>
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
        let principal = req.extensions().get::<Principal>();
        let path = req.uri().path();
        let method = req.method().as_str();

        let verdict = authorize(&self.config, principal, path, method);
        match &verdict {
            Ok(()) => debug!(path, method, "Access granted"),
            Err(Rejection::Forbidden {
                required_role,
                current_role,
            }) => warn!(
                path,
                method,
                user = principal.map(|p| p.username.as_str()).unwrap_or_default(),
                current_role = %current_role,
                required_role = %required_role,
                "Access denied"
            ),
            Err(_) => debug!(path, method, "Anonymous request to protected endpoint"),
        }

        let mut inner = self.inner.clone();

        Box::pin(async move {
            match verdict {
                Ok(()) => inner.call(req).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}
