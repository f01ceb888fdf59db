use serde::{Deserialize, Serialize};

/// Resolved caller role, provided by the upstream auth layer.
///
/// This service never computes roles; it only consumes the value the auth
/// proxy resolved for the request. Ordering follows the role hierarchy, so
/// `role >= Role::Admin` reads as "admin or better".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    /// Parse a role from its wire form. Unknown or missing values resolve to
    /// the least-privileged role rather than failing the request.
    pub fn parse(value: &str) -> Role {
        match value.trim().to_ascii_lowercase().as_str() {
            "superadmin" => Role::Superadmin,
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }

    /// Check whether this role meets a minimum required role.
    pub fn has_role(self, required: Role) -> bool {
        self >= required
    }
}
