//! Backend services and the transport used to reach them.

pub mod circuit_breaker;
mod dispatcher;
mod http;

pub use self::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use self::dispatcher::ProxyDispatcher;
pub use self::http::HttpBackend;

use async_trait::async_trait;
use axum::body::Body;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, GatewayConfig};
use crate::context::Deadline;

/// Why a single attempt against a backend failed before a response head arrived.
#[derive(Error, Debug)]
pub enum BackendFailure {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("deadline exceeded")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendFailure {
    /// Failures that left the backend untouched or mid-handshake and may be retried.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Timeout)
    }
}

/// Transport to one backend service.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Sends the request and returns once response headers arrive; the body streams.
    async fn send(
        &self,
        req: ::http::Request<Body>,
        deadline: Deadline,
    ) -> Result<::http::Response<Body>, BackendFailure>;

    /// Fetches `path` and reports the status code.
    async fn probe(&self, path: &str, timeout: Duration) -> Result<::http::StatusCode, BackendFailure>;
}

/// A named backend service.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub name: String,
    pub critical: bool,
    pub health_path: String,
    pub backend: Arc<dyn Backend>,
}

/// All backend services known to the gateway, keyed by name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceEndpoint>>,
}

impl ServiceRegistry {
    pub fn new(endpoints: impl IntoIterator<Item = ServiceEndpoint>) -> Self {
        Self {
            services: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.name.clone(), Arc::new(endpoint)))
                .collect(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let endpoints = config
            .services
            .iter()
            .map(|(name, service)| {
                let backend = HttpBackend::from_url(&service.url)?
                    .with_connect_timeout(config.limits.connect_timeout);
                Ok(ServiceEndpoint {
                    name: name.clone(),
                    critical: service.critical,
                    health_path: service.health_path.clone(),
                    backend: Arc::new(backend),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self::new(endpoints))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceEndpoint>> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceEndpoint>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
