use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Authenticated user as returned by `GET /api/auth/me`.
///
/// Never edited client-side; a fresh fetch replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub is_active: bool,
    pub is_verified: bool,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|r| self.roles.contains(r.as_ref()))
    }

    /// Name for display, falling back to the username when the full name is blank
    pub fn display_name(&self) -> &str {
        if self.full_name.trim().is_empty() {
            &self.username
        } else {
            &self.full_name
        }
    }

    /// "Position, Department" line, skipping whichever part is missing
    pub fn job_line(&self) -> Option<String> {
        match (self.position.as_deref(), self.department.as_deref()) {
            (Some(p), Some(d)) => Some(format!("{}, {}", p, d)),
            (Some(p), None) => Some(p.to_string()),
            (None, Some(d)) => Some(d.to_string()),
            (None, None) => None,
        }
    }
}
