//! Caller identity: token verification, revocation lookups and access policy.

mod claims;
pub mod policy;
pub mod revocation;
mod verifier;

pub use claims::{IdentityClaims, Role, TokenClaims};
pub use policy::{authorize, AccessDecision};
pub use revocation::{HttpRevocationClient, RevocationCheck, RevocationError};
pub use verifier::TokenVerifier;
