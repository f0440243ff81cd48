use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Platform roles, ordered by privilege.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Customer,
    Vendor,
    Admin,
    #[serde(alias = "super-admin", alias = "superadmin")]
    SuperAdmin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Vendor => "vendor",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    pub fn satisfies(self, required: Self) -> bool {
        self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claims as they appear in the signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(
        default,
        alias = "session_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Verified identity of the caller, valid for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: String,
    pub role: Role,
    pub permissions: HashSet<String>,
    pub issued_at: Option<u64>,
    pub expires_at: u64,
    pub session_id: Option<String>,
}

impl IdentityClaims {
    /// True if any of `required` is held. An empty list is trivially satisfied.
    pub fn has_any_permission(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|p| self.permissions.contains(p))
    }
}

impl From<TokenClaims> for IdentityClaims {
    fn from(claims: TokenClaims) -> Self {
        Self {
            subject: claims.sub,
            role: claims.role,
            permissions: claims.permissions.into_iter().collect(),
            issued_at: claims.iat,
            expires_at: claims.exp,
            session_id: claims.sid,
        }
    }
}
