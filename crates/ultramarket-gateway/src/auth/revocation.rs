//! Client for the external token revocation authority.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, RevocationConfig};

#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("revocation lookup timed out")]
    Timeout,

    #[error("revocation authority request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("revocation authority returned {0}")]
    Status(u16),
}

impl From<reqwest::Error> for RevocationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}

/// Answers whether a token has been revoked before its expiry.
#[async_trait]
pub trait RevocationCheck: Send + Sync + Debug {
    async fn is_revoked(&self, token: &str) -> Result<bool, RevocationError>;
}

#[derive(Serialize)]
struct VerifyTokenRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct VerifyTokenResponse {
    #[serde(default, alias = "blacklisted")]
    revoked: bool,
}

/// Calls `POST {url}/verify-token` on the revocation authority.
#[derive(Debug, Clone)]
pub struct HttpRevocationClient {
    client: Client,
    endpoint: String,
}

impl HttpRevocationClient {
    pub fn new(config: &RevocationConfig) -> Result<Self, ConfigError> {
        Self::with_timeout(&config.url, config.timeout)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("revocation client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/verify-token", url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl RevocationCheck for HttpRevocationClient {
    async fn is_revoked(&self, token: &str) -> Result<bool, RevocationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&VerifyTokenRequest { token })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RevocationError::Status(response.status().as_u16()));
        }

        let body: VerifyTokenResponse = response.json().await?;
        Ok(body.revoked)
    }
}
