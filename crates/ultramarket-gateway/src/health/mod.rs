//! Backend health tracking.

mod aggregator;

pub use aggregator::{overall_status, BackendReport, HealthAggregator, HealthReport, OverallStatus};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

/// Last known state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not probed yet, or failing below the unhealthy threshold since startup.
    Unknown,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// Health data for a single backend.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub status: HealthStatus,
    pub last_latency: Option<Duration>,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_latency: None,
            last_checked: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Probe results per backend, with hysteresis on the way down.
#[derive(Debug)]
pub struct HealthRegistry {
    unhealthy_threshold: u32,
    records: DashMap<String, BackendHealth>,
}

impl HealthRegistry {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold: unhealthy_threshold.max(1),
            records: DashMap::new(),
        }
    }

    /// A passing probe restores the backend immediately.
    pub fn record_success(&self, service: &str, latency: Duration) {
        let mut entry = self.records.entry(service.to_owned()).or_default();

        if entry.status != HealthStatus::Healthy {
            tracing::info!(
                service,
                previous = entry.status.as_str(),
                "backend healthy"
            );
        }

        entry.status = HealthStatus::Healthy;
        entry.consecutive_failures = 0;
        entry.last_latency = Some(latency);
        entry.last_checked = Some(Utc::now());
        entry.last_error = None;
    }

    /// A failing probe only flips the backend once the threshold is reached.
    pub fn record_failure(&self, service: &str, error: impl Into<String>) {
        let mut entry = self.records.entry(service.to_owned()).or_default();

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_checked = Some(Utc::now());
        entry.last_latency = None;
        entry.last_error = Some(error.into());

        if entry.consecutive_failures >= self.unhealthy_threshold
            && entry.status != HealthStatus::Unhealthy
        {
            entry.status = HealthStatus::Unhealthy;
            tracing::warn!(
                service,
                consecutive_failures = entry.consecutive_failures,
                error = entry.last_error.as_deref().unwrap_or_default(),
                "backend unhealthy"
            );
        }
    }

    pub fn status(&self, service: &str) -> HealthStatus {
        self.records
            .get(service)
            .map_or(HealthStatus::Unknown, |r| r.status)
    }

    pub fn get(&self, service: &str) -> Option<BackendHealth> {
        self.records.get(service).map(|r| r.clone())
    }
}
