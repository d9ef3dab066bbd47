use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::access::DEFAULT_ROLE;

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

/// An authenticated caller, attached to the request by the identity stage.
///
/// Requests without a `Principal` extension are anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
}

impl Principal {
    pub fn new(id: u64, username: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: String::new(),
            role: role.into(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    /// Whether this principal may pass maintenance mode.
    pub fn is_admin(&self) -> bool {
        matches!(self.role.as_str(), "admin" | "superuser")
    }
}

/// Describe the caller for request logs and echo responses.
pub fn describe_user(principal: Option<&Principal>) -> Value {
    match principal {
        Some(p) => json!({
            "id": p.id,
            "username": p.username,
            "email": p.email,
            "role": p.role,
        }),
        None => json!({ "id": null, "username": "anonymous" }),
    }
}
