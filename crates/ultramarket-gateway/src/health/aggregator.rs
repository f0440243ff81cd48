use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{HealthRegistry, HealthStatus};
use crate::backend::{ServiceEndpoint, ServiceRegistry};

/// Platform-wide health derived from every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Any critical backend down is unhealthy; anything short of all healthy is degraded.
pub fn overall_status(backends: impl IntoIterator<Item = (bool, HealthStatus)>) -> OverallStatus {
    let mut all_healthy = true;
    for (critical, status) in backends {
        if critical && status == HealthStatus::Unhealthy {
            return OverallStatus::Unhealthy;
        }
        all_healthy &= status == HealthStatus::Healthy;
    }

    if all_healthy {
        OverallStatus::Healthy
    } else {
        OverallStatus::Degraded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub name: String,
    pub critical: bool,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub generated_at: DateTime<Utc>,
    pub services: Vec<BackendReport>,
}

/// Probes every backend concurrently and summarises the results.
#[derive(Debug)]
pub struct HealthAggregator {
    services: Arc<ServiceRegistry>,
    registry: Arc<HealthRegistry>,
    probe_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(
        services: Arc<ServiceRegistry>,
        registry: Arc<HealthRegistry>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            services,
            registry,
            probe_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Probes all backends at once; total latency is bounded by the probe timeout.
    pub async fn check_all(&self) -> HealthReport {
        join_all(self.services.iter().map(|service| self.probe(service))).await;
        self.snapshot()
    }

    async fn probe(&self, service: &ServiceEndpoint) {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.probe_timeout,
            service
                .backend
                .probe(&service.health_path, self.probe_timeout),
        )
        .await;

        match result {
            Ok(Ok(status)) if status.is_success() => {
                self.registry.record_success(&service.name, started.elapsed());
            }
            Ok(Ok(status)) => {
                self.registry
                    .record_failure(&service.name, format!("health probe returned {status}"));
            }
            Ok(Err(failure)) => {
                self.registry.record_failure(&service.name, failure.to_string());
            }
            Err(_) => {
                self.registry
                    .record_failure(&service.name, "health probe timed out");
            }
        }
    }

    /// Last known state without probing.
    pub fn snapshot(&self) -> HealthReport {
        let mut services: Vec<BackendReport> = self
            .services
            .iter()
            .map(|service| {
                let record = self.registry.get(&service.name).unwrap_or_default();
                BackendReport {
                    name: service.name.clone(),
                    critical: service.critical,
                    status: record.status,
                    latency_ms: record
                        .last_latency
                        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                    consecutive_failures: record.consecutive_failures,
                    last_checked: record.last_checked,
                    error: record.last_error,
                }
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        HealthReport {
            status: overall_status(services.iter().map(|s| (s.critical, s.status))),
            generated_at: Utc::now(),
            services,
        }
    }

    /// Re-probes every backend on `interval` until `cancel` fires.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = aggregator.check_all().await;
                        tracing::debug!(status = ?report.status, "health poll complete");
                    }
                }
            }
            tracing::debug!("health poller stopped");
        })
    }
}
