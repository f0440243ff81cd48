//! Per-request values threaded through the pipeline.

use axum::http::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::IdentityClaims;
use crate::routes::RouteDescriptor;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LENGTH: usize = 128;

/// Identifier that follows one request through every log line and backend hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Reads a caller-supplied id, ignoring empty, oversized or non-visible values.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(CORRELATION_ID_HEADER)?.to_str().ok()?.trim();

        let acceptable = !value.is_empty()
            && value.len() <= MAX_CORRELATION_ID_LENGTH
            && value.bytes().all(|b| b.is_ascii_graphic());

        acceptable.then(|| Self(value.to_owned()))
    }

    /// Caller-supplied id if usable, otherwise a fresh one.
    pub fn resolve(headers: &HeaderMap) -> Self {
        Self::from_headers(headers).unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Client address as seen by the gateway (peer or trusted forwarded hop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub IpAddr);

/// Absolute point in time after which a dispatch is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(tokio::time::Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(tokio::time::Instant::now() + timeout)
    }

    pub const fn instant(self) -> tokio::time::Instant {
        self.0
    }

    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(tokio::time::Instant::now())
    }

    pub fn is_expired(self) -> bool {
        self.remaining().is_zero()
    }
}

/// Everything the dispatcher needs to know about an admitted request.
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub correlation_id: CorrelationId,
    pub route: Arc<RouteDescriptor>,
    pub params: HashMap<String, String>,
    /// Path forwarded to the backend, without query string.
    pub upstream_path: String,
    pub identity: Option<IdentityClaims>,
    pub client_addr: Option<IpAddr>,
    pub started_at: Instant,
}
