//! Access policy evaluation against a route's requirement.

use std::collections::HashMap;

use super::claims::{IdentityClaims, Role};
use crate::error::AuthzError;
use crate::routes::RouteAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(AuthzError),
}

impl AccessDecision {
    pub fn into_result(self) -> Result<(), AuthzError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(reason) => Err(reason),
        }
    }
}

/// Decides whether `claims` may use a route with the given access requirement.
///
/// Pure and side-effect free; `params` are the path parameters captured for the route.
pub fn authorize(
    claims: Option<&IdentityClaims>,
    access: &RouteAccess,
    params: &HashMap<String, String>,
) -> AccessDecision {
    let claims = match (access, claims) {
        (RouteAccess::Public, _) => return AccessDecision::Allow,
        (_, None) => return AccessDecision::Deny(AuthzError::Unauthenticated),
        (_, Some(claims)) => claims,
    };

    match access {
        RouteAccess::Public => AccessDecision::Allow,
        RouteAccess::Authenticated {
            min_role,
            permissions,
        } => {
            if !claims.role.satisfies(*min_role) {
                AccessDecision::Deny(AuthzError::InsufficientRole)
            } else if !claims.has_any_permission(permissions) {
                AccessDecision::Deny(AuthzError::InsufficientPermission)
            } else {
                AccessDecision::Allow
            }
        }
        RouteAccess::SelfAccess { param } => {
            let owns = params.get(param).is_some_and(|id| *id == claims.subject);
            if owns || claims.role.satisfies(Role::Admin) {
                AccessDecision::Allow
            } else {
                AccessDecision::Deny(AuthzError::NotResourceOwner)
            }
        }
    }
}
