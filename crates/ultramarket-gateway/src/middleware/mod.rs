//! Gateway middleware.

pub mod correlation;
pub mod metrics;
pub mod security;

pub use correlation::CorrelationLayer;
pub use metrics::{MetricsLayer, ServiceLabel};
pub use security::SecurityLayer;
