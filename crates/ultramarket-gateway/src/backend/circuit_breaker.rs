//! Circuit breaker for backend resilience.
//!
//! The circuit breaker stops dispatching to a backend that keeps failing. It has
//! three states:
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Backend is failing, requests are rejected immediately
//! - **HalfOpen**: Reset timeout elapsed, trial requests decide the next state

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for a single backend service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Check if a request should be allowed through.
    pub fn allow_request(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
            if !cooled {
                return Err(GatewayError::CircuitOpen {
                    service: self.service.clone(),
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            tracing::info!(service = %self.service, "circuit breaker half-open");
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    tracing::info!(service = %self.service, "circuit breaker closed after recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        service = %self.service,
                        failure_count = inner.failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                tracing::warn!(service = %self.service, "circuit breaker reopened from half-open");
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }
}

/// Circuit breakers keyed by service name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(service) {
            return Arc::clone(breaker.value());
        }

        Arc::clone(
            self.breakers
                .entry(service.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config.clone())))
                .value(),
        )
    }
}
