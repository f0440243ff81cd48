//! Edge gateway for the UltraMarket platform.
//!
//! Every inbound call passes through one pipeline: route resolution, bearer
//! token verification, access policy, sliding-window rate limiting and finally
//! a streaming proxy to the owning backend service. Backend health is polled
//! concurrently in the background and exposed on the operational endpoints.

pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod middleware;
pub mod pipeline;
pub mod rate_limit;
pub mod routes;
pub mod server;

pub use config::{ConfigError, GatewayConfig};
pub use error::{AuthError, AuthzError, GatewayError, RateLimitError, RequestError};
pub use pipeline::GatewayPipeline;
pub use server::{run, GatewayServer};
