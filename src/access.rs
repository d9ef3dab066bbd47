//! Role-based access policy.
//!
//! A [`RoleAccessConfig`] maps role names to a [`RolePolicy`] describing which
//! path prefixes and HTTP methods the role may use. Roles are kept in
//! declaration order, least privileged first; that order decides which role
//! is reported as required when a request is refused.
//!
//! # Evaluation
//!
//! For a role, path and method:
//!
//! 1. Any matching `denied_paths` prefix denies.
//! 2. A method listed in `denied_methods` denies.
//! 3. `*` in `allowed_paths` allows.
//! 4. Otherwise access needs a matching `allowed_paths` prefix *and* the method
//!    to be allowed (`allowed_methods` empty, containing `*`, or listing it).
//!
//! Unknown roles have an empty policy and are denied everything.

use serde::{Deserialize, Serialize};

/// Wildcard accepted in `allowed_paths` and `allowed_methods`.
pub const WILDCARD: &str = "*";

/// Role assumed for principals without an explicit role.
pub const DEFAULT_ROLE: &str = "user";

/// Role reported as required when no configured role is granted access.
pub const FALLBACK_REQUIRED_ROLE: &str = "admin";

/// Path prefixes that never require authentication.
pub const PUBLIC_PATHS: [&str; 5] = [
    "/api/auth/login/",
    "/api/auth/register/",
    "/api/auth/token/refresh/",
    "/admin/login/",
    "/api/health/",
];

/// Whether a path is reachable without credentials.
pub fn is_public_endpoint(path: &str) -> bool {
    PUBLIC_PATHS.iter().any(|public| path.starts_with(public))
}

/// Paths and methods a single role may use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePolicy {
    pub allowed_paths: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub denied_paths: Vec<String>,
    pub denied_methods: Vec<String>,
}

impl RolePolicy {
    fn from_lists(
        allowed_paths: &[&str],
        allowed_methods: &[&str],
        denied_paths: &[&str],
        denied_methods: &[&str],
    ) -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            allowed_paths: owned(allowed_paths),
            allowed_methods: owned(allowed_methods),
            denied_paths: owned(denied_paths),
            denied_methods: owned(denied_methods),
        }
    }

    /// Evaluate this policy for a request.
    pub fn permits(&self, path: &str, method: &str) -> bool {
        if self.denied_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return false;
        }

        if self
            .denied_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
        {
            return false;
        }

        if self.allowed_paths.iter().any(|p| p == WILDCARD) {
            return true;
        }

        let path_access = self
            .allowed_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()));

        let method_access = self.allowed_methods.is_empty()
            || self
                .allowed_methods
                .iter()
                .any(|m| m == WILDCARD || m.eq_ignore_ascii_case(method));

        path_access && method_access
    }
}

/// Ordered role to policy mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAccessConfig {
    roles: Vec<(String, RolePolicy)>,
}

impl RoleAccessConfig {
    /// Build from an explicit, ordered list of roles.
    pub fn new(roles: Vec<(String, RolePolicy)>) -> Self {
        Self { roles }
    }

    /// Parse a JSON object of role to policy and lay it over the defaults.
    ///
    /// Roles already present in the defaults keep their position and take the
    /// configured policy; new roles are appended in the order given.
    pub fn with_overrides(json: &str) -> Result<Self, serde_json::Error> {
        let overrides: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut config = Self::default();

        for (role, raw) in overrides {
            let policy: RolePolicy = serde_json::from_value(raw)?;
            match config.roles.iter_mut().find(|(name, _)| *name == role) {
                Some((_, existing)) => *existing = policy,
                None => config.roles.push((role, policy)),
            }
        }

        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Role names in privilege order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(|(name, _)| name.as_str())
    }

    pub fn policy(&self, role: &str) -> Option<&RolePolicy> {
        self.roles
            .iter()
            .find(|(name, _)| name == role)
            .map(|(_, policy)| policy)
    }

    /// Whether `role` may use `method` on `path`.
    pub fn has_access(&self, role: &str, path: &str, method: &str) -> bool {
        self.policy(role)
            .is_some_and(|policy| policy.permits(path, method))
    }

    /// Least privileged role that may use `method` on `path`.
    ///
    /// Roles are scanned in table order (least privileged first), so this
    /// reports the lowest granting role rather than always `admin`.
    pub fn required_role(&self, path: &str, method: &str) -> &str {
        self.roles
            .iter()
            .find(|(_, policy)| policy.permits(path, method))
            .map(|(name, _)| name.as_str())
            .unwrap_or(FALLBACK_REQUIRED_ROLE)
    }
}

impl Default for RoleAccessConfig {
    fn default() -> Self {
        Self::new(vec![
            (
                "user".to_string(),
                RolePolicy::from_lists(
                    &["/api/chats/", "/api/conversations/", "/api/messages/"],
                    &["GET", "POST"],
                    &["/admin/", "/api/admin/"],
                    &[],
                ),
            ),
            (
                "moderator".to_string(),
                RolePolicy::from_lists(
                    &["/api/", "/admin/core/", "/admin/chats/"],
                    &["GET", "POST", "PUT", "PATCH"],
                    &[],
                    &["DELETE"],
                ),
            ),
            (
                "admin".to_string(),
                RolePolicy::from_lists(&[WILDCARD], &[WILDCARD], &[], &[]),
            ),
        ])
    }
}
