//! Sliding-window rate limiting per caller and traffic class.
//!
//! Every admission checks the caller's class window and, when enabled, a short
//! burst window. Both are purged, counted and appended as one atomic step in the
//! backing [`WindowStore`], so concurrent requests for one key never overshoot.

mod store;
mod valkey;

pub use store::{Acquisition, InMemoryWindowStore, StoreError, WindowSnapshot, WindowSpec, WindowStore};
pub use valkey::ValkeyWindowStore;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::IdentityClaims;
use crate::config::{RateLimitConfig, RateLimitStoreConfig, WindowLimit};
use crate::error::RateLimitError;
use crate::routes::TrafficClass;

const BURST_SCOPE: &str = "burst";

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        limit: u32,
        remaining: u32,
        /// Epoch ms at which the class window frees its oldest slot.
        reset_at_ms: u64,
    },
    Rejected(RateLimitError),
}

/// Rate-limit key for a caller: the token subject, else the client address.
pub fn caller_key(identity: Option<&IdentityClaims>, client: Option<IpAddr>) -> String {
    match (identity, client) {
        (Some(identity), _) => format!("user:{}", identity.subject),
        (None, Some(addr)) => format!("ip:{addr}"),
        (None, None) => "ip:unknown".to_owned(),
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn WindowStore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn WindowStore>) -> Self {
        Self { config, store }
    }

    /// Builds the limiter with the store named in configuration.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn WindowStore> = match &config.store {
            RateLimitStoreConfig::Memory => Arc::new(InMemoryWindowStore::new()),
            RateLimitStoreConfig::Valkey { url, key_prefix } => {
                Arc::new(ValkeyWindowStore::new(
                    url,
                    key_prefix.clone(),
                    config.store_timeout,
                )?)
            }
        };
        tracing::info!(store = store.name(), "rate limiter ready");
        Ok(Self::new(config.clone(), store))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn admit(&self, key: &str, class: TrafficClass) -> Admission {
        self.admit_at(key, class, now_ms()).await
    }

    /// Admission check at an explicit instant in epoch milliseconds.
    pub async fn admit_at(&self, key: &str, class: TrafficClass, now_ms: u64) -> Admission {
        let class_limit = *self.config.classes.for_class(class);
        let mut specs = vec![window_spec(format!("{class}:{key}"), class_limit)];
        let mut scopes = vec![class.as_str()];
        if self.config.burst.enabled {
            specs.push(window_spec(
                format!("{BURST_SCOPE}:{key}"),
                self.config.burst.limit(),
            ));
            scopes.push(BURST_SCOPE);
        }

        let acquisition = match self.bounded(self.store.try_acquire(&specs, now_ms)).await {
            Ok(acquisition) => acquisition,
            Err(e) if self.config.fail_open => {
                tracing::warn!(error = %e, key, class = %class, "rate limit store unavailable, admitting request");
                return Admission::Admitted {
                    limit: class_limit.max_requests,
                    remaining: class_limit.max_requests.saturating_sub(1),
                    reset_at_ms: now_ms.saturating_add(specs[0].window_ms),
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, key, class = %class, "rate limit store unavailable, rejecting request");
                return Admission::Rejected(RateLimitError {
                    scope: class.as_str(),
                    retry_after: Duration::from_secs(1),
                });
            }
        };

        if acquisition.admitted {
            let class_window = acquisition
                .windows
                .first()
                .copied()
                .unwrap_or(WindowSnapshot {
                    count: 0,
                    oldest_ms: None,
                });
            let oldest = class_window.oldest_ms.unwrap_or(now_ms);
            return Admission::Admitted {
                limit: class_limit.max_requests,
                remaining: class_limit
                    .max_requests
                    .saturating_sub(class_window.count.saturating_add(1)),
                reset_at_ms: oldest.saturating_add(specs[0].window_ms),
            };
        }

        // Every full window would still reject, so the caller waits for the longest.
        let (retry_ms, scope) = specs
            .iter()
            .zip(&acquisition.windows)
            .zip(&scopes)
            .filter(|((spec, window), _)| window.count >= spec.limit)
            .map(|((spec, window), scope)| {
                let oldest = window.oldest_ms.unwrap_or(now_ms);
                let free_at = oldest.saturating_add(spec.window_ms);
                (free_at.saturating_sub(now_ms), *scope)
            })
            .max_by_key(|(retry_ms, _)| *retry_ms)
            .unwrap_or((duration_ms(class_limit.window), class.as_str()));

        Admission::Rejected(RateLimitError {
            scope,
            retry_after: Duration::from_millis(retry_ms.max(1)),
        })
    }

    /// Drops windows idle for longer than the longest configured window.
    pub async fn sweep_at(&self, now_ms: u64) -> usize {
        let longest = self
            .config
            .classes
            .longest_window()
            .max(self.config.burst.window);
        let idle_before = now_ms.saturating_sub(duration_ms(longest));

        match self.bounded(self.store.sweep(idle_before)).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(removed, "swept idle rate limit windows");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate limit sweep failed");
                0
            }
        }
    }

    /// Runs one store call, giving up after `store_timeout`.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.config.store_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(limit)))
    }

    /// Spawns the periodic sweeper; it stops when `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep_at(now_ms()).await;
                    }
                }
            }
            tracing::debug!("rate limit sweeper stopped");
        })
    }
}

fn window_spec(key: String, limit: WindowLimit) -> WindowSpec {
    WindowSpec {
        key,
        limit: limit.max_requests,
        window_ms: duration_ms(limit.window),
    }
}
