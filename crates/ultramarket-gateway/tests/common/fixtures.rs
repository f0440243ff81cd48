//! Test fixtures for gateway integration tests.

use jsonwebtoken::{encode, EncodingKey, Header};
use std::time::{SystemTime, UNIX_EPOCH};
use ultramarket_gateway::auth::{Role, TokenClaims};

pub const SECRET: &str = "integration-test-secret";

/// Builder for signed bearer tokens.
pub struct TokenBuilder {
    subject: String,
    role: Role,
    permissions: Vec<String>,
    expires_in: i64,
    session_id: Option<String>,
}

impl TokenBuilder {
    /// A customer token valid for an hour.
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            role: Role::Customer,
            permissions: vec![],
            expires_in: 3600,
            session_id: None,
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn permission(mut self, permission: &str) -> Self {
        self.permissions.push(permission.to_string());
        self
    }

    /// Expired well beyond any leeway.
    pub fn expired(mut self) -> Self {
        self.expires_in = -3600;
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn build(self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let claims = TokenClaims {
            sub: self.subject,
            role: self.role,
            permissions: self.permissions,
            exp: (now + self.expires_in) as u64,
            iat: Some(now as u64),
            sid: self.session_id,
            iss: None,
            aud: None,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }
}

/// Gateway configuration with the platform's usual routes pointing at `backend`.
///
/// `extra` is appended verbatim, so tests can add sections such as
/// `[rate_limit.burst]` without restating the whole file.
pub fn platform_config(backend: &str, extra: &str) -> String {
    format!(
        r#"
[auth]
secret = "{SECRET}"

[services.orders]
url = "http://{backend}"
critical = true

[services.products]
url = "http://{backend}"

[[routes]]
prefix = "/api/v1/orders"
service = "orders"

[[routes]]
prefix = "/api/v1/products"
service = "products"
access = {{ kind = "public" }}

[[routes]]
prefix = "/api/v1/admin"
service = "orders"
access = {{ kind = "authenticated", min_role = "admin" }}

[[routes]]
prefix = "/api/v1/refunds"
service = "orders"
traffic_class = "payment"
access = {{ kind = "authenticated", permissions = ["refunds:write", "payments:admin"] }}

[[routes]]
prefix = "/api/v1/users/{{user_id}}"
service = "orders"
access = {{ kind = "self_access", param = "user_id" }}

[health]
enabled = false

{extra}
"#
    )
}
