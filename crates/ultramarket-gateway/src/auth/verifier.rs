//! Bearer token verification.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::fmt;
use std::sync::Arc;

use super::claims::{IdentityClaims, TokenClaims};
use super::revocation::{HttpRevocationClient, RevocationCheck};
use crate::config::{AuthAlgorithm, AuthConfig, ConfigError};
use crate::error::AuthError;

/// Verifies HMAC-signed bearer tokens and produces the caller's identity.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    revocation: Option<Arc<dyn RevocationCheck>>,
    revocation_fail_open: bool,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .field("revocation", &self.revocation)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Builds a verifier, wiring the HTTP revocation client when configured.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let mut verifier = Self::new(config);
        if let Some(revocation) = &config.revocation {
            verifier.revocation = Some(Arc::new(HttpRevocationClient::new(revocation)?));
            verifier.revocation_fail_open = revocation.fail_open;
        }
        Ok(verifier)
    }

    pub fn new(config: &AuthConfig) -> Self {
        let algorithm = match config.algorithm {
            AuthAlgorithm::HS256 => Algorithm::HS256,
            AuthAlgorithm::HS384 => Algorithm::HS384,
            AuthAlgorithm::HS512 => Algorithm::HS512,
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway_secs;

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            revocation: None,
            revocation_fail_open: true,
        }
    }

    #[must_use]
    pub fn with_revocation(mut self, check: Arc<dyn RevocationCheck>, fail_open: bool) -> Self {
        self.revocation = Some(check);
        self.revocation_fail_open = fail_open;
        self
    }

    /// Extracts the token from `Authorization: Bearer <token>`.
    pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::Missing)?
            .to_str()
            .map_err(|_| AuthError::Invalid)?;

        let (scheme, token) = value.split_once(' ').ok_or(AuthError::Missing)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::Missing);
        }

        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(token)
    }

    /// Verifies the request's bearer credential.
    pub async fn verify(&self, headers: &HeaderMap) -> Result<IdentityClaims, AuthError> {
        let token = Self::bearer_token(headers)?;
        self.verify_token(token).await
    }

    pub async fn verify_token(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => {
                    tracing::debug!(error = %e, "token validation failed");
                    AuthError::Invalid
                }
            }
        })?;

        let identity = IdentityClaims::from(data.claims);

        if identity.session_id.is_some() {
            self.check_revocation(token, &identity).await?;
        }

        Ok(identity)
    }

    async fn check_revocation(&self, token: &str, identity: &IdentityClaims) -> Result<(), AuthError> {
        let Some(revocation) = &self.revocation else {
            return Ok(());
        };

        match revocation.is_revoked(token).await {
            Ok(false) => Ok(()),
            Ok(true) => {
                tracing::warn!(subject = %identity.subject, "revoked token presented");
                Err(AuthError::Invalid)
            }
            Err(e) if self.revocation_fail_open => {
                tracing::warn!(error = %e, subject = %identity.subject, "revocation check unavailable, admitting token");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, subject = %identity.subject, "revocation check unavailable, rejecting token");
                Err(AuthError::Invalid)
            }
        }
    }
}
