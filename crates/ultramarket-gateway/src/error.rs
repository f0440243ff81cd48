//! Gateway error types.
//!
//! Each pipeline stage has its own small error enum; [`RequestError`] unifies
//! them at the edge and renders the JSON body every rejection carries.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::context::CorrelationId;

/// Bearer token verification failures. All map to 401.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer credential")]
    Missing,

    #[error("Invalid credential")]
    Invalid,

    #[error("Credential expired")]
    Expired,
}

impl AuthError {
    pub const fn error_type(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
        }
    }
}

/// Access policy denials.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Insufficient role")]
    InsufficientRole,

    #[error("Insufficient permission")]
    InsufficientPermission,

    #[error("Resource belongs to another user")]
    NotResourceOwner,
}

impl AuthzError {
    pub const fn error_type(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InsufficientRole => "insufficient_role",
            Self::InsufficientPermission => "insufficient_permission",
            Self::NotResourceOwner => "not_resource_owner",
        }
    }

    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InsufficientRole | Self::InsufficientPermission | Self::NotResourceOwner => {
                StatusCode::FORBIDDEN
            }
        }
    }
}

/// A request rejected by the sliding-window limiter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Rate limit exceeded for {scope}, retry after {retry_after:?}")]
pub struct RateLimitError {
    /// Traffic class name, or `burst` when the burst cap rejected.
    pub scope: &'static str,
    pub retry_after: Duration,
}

impl RateLimitError {
    /// Whole seconds for the `Retry-After` header, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_millis().div_ceil(1000).max(1) as u64
    }
}

/// Routing and backend dispatch failures.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Backend {service} unreachable: {reason}")]
    BackendUnreachable { service: String, reason: String },

    #[error("Backend {service} timed out")]
    BackendTimeout { service: String },

    #[error("Backend {service} sent a bad response: {reason}")]
    BackendBadResponse { service: String, reason: String },

    #[error("Backend {service} is unhealthy")]
    BackendUnhealthy { service: String },

    #[error("Circuit breaker open for {service}")]
    CircuitOpen { service: String },

    #[error("Request build failed: {0}")]
    RequestBuildFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "route_not_found",
            Self::BackendUnreachable { .. } => "backend_unreachable",
            Self::BackendTimeout { .. } => "backend_timeout",
            Self::BackendBadResponse { .. } => "backend_bad_response",
            Self::BackendUnhealthy { .. } => "backend_unhealthy",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RequestBuildFailed(_) => "request_build_failed",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnreachable { .. } | Self::BackendBadResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendUnhealthy { .. } | Self::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::RequestBuildFailed(_) | Self::Config(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Backend the failure is attributed to, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::BackendUnreachable { service, .. }
            | Self::BackendTimeout { service }
            | Self::BackendBadResponse { service, .. }
            | Self::BackendUnhealthy { service }
            | Self::CircuitOpen { service } => Some(service),
            _ => None,
        }
    }

    /// Whether this failure counts against the backend's circuit.
    pub const fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable { .. }
                | Self::BackendTimeout { .. }
                | Self::BackendBadResponse { .. }
        )
    }

    /// Message safe to show to external callers.
    fn public_message(&self) -> String {
        match self {
            Self::RouteNotFound(_) => "No route for this path".to_owned(),
            Self::BackendUnreachable { .. } => "Upstream service unreachable".to_owned(),
            Self::BackendTimeout { .. } => "Upstream service timed out".to_owned(),
            Self::BackendBadResponse { .. } => "Bad response from upstream service".to_owned(),
            Self::BackendUnhealthy { .. } | Self::CircuitOpen { .. } => {
                "Service temporarily unavailable".to_owned()
            }

            // Hide internal details for security
            Self::RequestBuildFailed(_) | Self::Config(_) | Self::Io(_) => {
                "Internal server error".to_owned()
            }
        }
    }
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.public_message()).into_response()
    }
}

/// Any reason the pipeline refused or failed a request.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'static str,
    correlation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl RequestError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Authz(e) => e.status_code(),
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Gateway(e) => e.status_code(),
        }
    }

    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.error_type(),
            Self::Authz(e) => e.error_type(),
            Self::RateLimited(_) => "rate_limited",
            Self::Gateway(e) => e.error_type(),
        }
    }

    /// Renders the error with the request's correlation id.
    pub fn into_response_with(self, correlation_id: &CorrelationId) -> Response {
        let status = self.status_code();

        let (message, service, retry_after_secs) = match &self {
            Self::Auth(e) => (e.to_string(), None, None),
            Self::Authz(e) => (e.to_string(), None, None),
            Self::RateLimited(e) => (
                "Rate limit exceeded".to_owned(),
                None,
                Some(e.retry_after_secs()),
            ),
            Self::Gateway(e) => (e.public_message(), e.service(), None),
        };

        let body = ErrorBody {
            error: message,
            code: self.error_type(),
            correlation_id: correlation_id.as_str(),
            service,
            retry_after_secs,
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();

        if let Some(secs) = retry_after_secs {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Self::Auth(e) = &self {
            let challenge = match e {
                AuthError::Missing => r#"Bearer realm="ultramarket""#,
                AuthError::Invalid | AuthError::Expired => {
                    r#"Bearer realm="ultramarket", error="invalid_token""#
                }
            };
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(challenge),
            );
        }

        response
    }
}
