use serde::{Deserialize, Serialize};

/// Permission that bypasses ownership checks on charts.
pub const ADMIN_PERMISSION: &str = "admin";

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl AuthenticatedUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Anonymous user used when authentication is disabled.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            username: None,
            permissions: vec!["*".to_string()],
        }
    }

    pub fn is_admin(&self) -> bool {
        self.permissions
            .iter()
            .any(|p| p == ADMIN_PERMISSION || p == "*")
    }

    /// Returns true if the user has the specified permission.
    /// Supports wildcards, e.g., 'chart:*' matches 'chart:write'.
    ///
    /// Admin permissions bypass all checks; the bypass is logged to the audit target.
    pub fn has_permission(&self, permission: &str) -> bool {
        if self.is_admin() {
            tracing::info!(
                target: "audit",
                user_id = %self.id,
                permission = %permission,
                "Permission granted via admin bypass"
            );
            return true;
        }

        self.permissions.iter().any(|p| {
            p == permission
                || p
                    .strip_suffix('*')
                    .is_some_and(|prefix| prefix.ends_with(':') && permission.starts_with(prefix))
        })
    }
}
