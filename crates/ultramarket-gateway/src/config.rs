//! Gateway configuration with layered loading and environment variable interpolation.

use figment::{
    providers::{Format, Toml},
    value::{Dict, Map, Value},
    Error as FigmentError, Figment, Metadata, Profile, Provider,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::routes::{RouteAccess, TrafficClass};

/// Maximum length for a backend service name.
pub const MAX_SERVICE_NAME_LENGTH: usize = 64;

static SERVICE_NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").ok());

/// Errors that can occur when loading or parsing gateway configuration.
///
/// These are fatal at startup and never surface per request.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    /// The specified configuration file was not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration is invalid or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Bearer token verification. Required when any route needs authentication.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Sliding-window rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Backend services keyed by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Route table entries.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Backend health polling.
    #[serde(default)]
    pub health: HealthConfig,

    /// Browser origin allow-list.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Request and connection limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Optional resilience middleware.
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Prometheus metrics endpoint configuration.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

impl GatewayConfig {
    /// Loads configuration from `GATEWAY_CONFIG`, falling back to `gateway.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.toml".to_owned());
        Self::load_from(path)
    }

    /// Loads and validates configuration from the specified file path.
    ///
    /// Environment variables prefixed with `GATEWAY_` override file settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new().merge(InterpolatingToml::file(path)?).merge(
            figment::providers::Env::prefixed("GATEWAY_")
                .ignore(&["CONFIG"])
                .split("__")
                .lowercase(true),
        );

        let config = figment.extract::<Self>().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(InterpolatingToml::string(content));
        let config = figment.extract::<Self>().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-references and invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, service) in &self.services {
            validate_service_name(name)?;
            parse_backend_url(&service.url).map_err(|reason| {
                ConfigError::Invalid(format!("service '{name}' has invalid url: {reason}"))
            })?;
        }

        let mut prefixes = HashSet::new();
        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "route prefix '{}' must start with '/'",
                    route.prefix
                )));
            }
            if !prefixes.insert(route.prefix.trim_end_matches('/')) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate route prefix '{}'",
                    route.prefix
                )));
            }
            if !self.services.contains_key(&route.service) {
                return Err(ConfigError::Invalid(format!(
                    "route '{}' references unknown service '{}'",
                    route.prefix, route.service
                )));
            }
            if let RouteAccess::SelfAccess { param } = &route.access {
                let placeholder = format!("{{{param}}}");
                if !route.prefix.split('/').any(|segment| segment == placeholder) {
                    return Err(ConfigError::Invalid(format!(
                        "route '{}' declares self access on '{param}' but the prefix has no such placeholder",
                        route.prefix
                    )));
                }
            }
            if let Some(rewrite) = &route.rewrite_prefix {
                if !rewrite.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "route '{}' rewrite prefix must start with '/'",
                        route.prefix
                    )));
                }
            }
        }

        let needs_auth = self.routes.iter().any(|r| r.access.auth_required());
        match &self.auth {
            Some(auth) if auth.secret.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "auth.secret (token verification key) must not be empty".into(),
                ));
            }
            None if needs_auth => {
                return Err(ConfigError::Invalid(
                    "routes require authentication but no [auth] verification key is configured"
                        .into(),
                ));
            }
            _ => {}
        }

        for class in TrafficClass::ALL {
            self.rate_limit
                .classes
                .for_class(class)
                .validate(class.as_str())?;
        }
        if self.rate_limit.burst.enabled {
            self.rate_limit.burst.limit().validate("burst")?;
        }
        if self.rate_limit.store_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "rate_limit.store_timeout must be greater than zero".into(),
            ));
        }

        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.unhealthy_threshold must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Validate a backend service name.
pub fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > MAX_SERVICE_NAME_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "service name '{name}' must be 1-{MAX_SERVICE_NAME_LENGTH} characters"
        )));
    }

    let Some(pattern) = SERVICE_NAME_PATTERN.as_ref() else {
        return Err(ConfigError::Invalid(
            "service name validation unavailable".into(),
        ));
    };

    if !pattern.is_match(name) {
        return Err(ConfigError::Invalid(format!(
            "service name '{name}' must start with a letter and contain only lowercase letters, numbers, '-' and '_'"
        )));
    }

    Ok(())
}

/// Splits a backend base URL into `(host, port, path prefix)`.
pub fn parse_backend_url(url: &str) -> Result<(String, u16, String), String> {
    let uri: http::Uri = url.parse().map_err(|e| format!("{e}"))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(format!("unsupported scheme '{other}'")),
        None => return Err("missing scheme".into()),
    }

    let host = uri.host().ok_or_else(|| "missing host".to_owned())?.to_owned();
    let port = uri.port_u16().unwrap_or(80);
    let base_path = uri.path().trim_end_matches('/').to_owned();

    Ok((host, port, base_path))
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address and port to bind the server to.
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Time to wait for in-flight requests during shutdown.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Take the client address from `X-Forwarded-For` set by the TLS terminator.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_timeout: default_shutdown_timeout(),
            trust_forwarded_headers: false,
        }
    }
}

const fn default_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Bearer token verification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret key for HMAC signature verification.
    pub secret: String,

    /// HMAC algorithm to use for verification.
    #[serde(default)]
    pub algorithm: AuthAlgorithm,

    /// Expected token issuer (`iss` claim).
    #[serde(default)]
    pub issuer: Option<String>,

    /// Expected token audience (`aud` claim).
    #[serde(default)]
    pub audience: Option<String>,

    /// Clock skew tolerated when checking `exp`, in seconds.
    #[serde(default)]
    pub leeway_secs: u64,

    /// External revocation authority, consulted for session-bound tokens.
    #[serde(default)]
    pub revocation: Option<RevocationConfig>,
}

/// JWT signing algorithm.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthAlgorithm {
    /// HMAC with SHA-256.
    #[default]
    HS256,
    /// HMAC with SHA-384.
    HS384,
    /// HMAC with SHA-512.
    HS512,
}

/// Revocation authority client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationConfig {
    /// Base URL of the authority; `/verify-token` is appended.
    pub url: String,

    /// Upper bound on one revocation lookup.
    #[serde(
        default = "default_revocation_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,

    /// Treat the token as not revoked when the authority is unavailable.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

const fn default_revocation_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_true() -> bool {
    true
}

/// A `(max_requests, window)` budget.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct WindowLimit {
    /// Requests admitted per window.
    pub max_requests: u32,

    /// Length of the trailing window.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

impl WindowLimit {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_requests == 0 || self.window.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "rate limit '{name}' needs max_requests > 0 and a non-zero window"
            )));
        }
        Ok(())
    }
}

/// Per traffic class budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrafficClassLimits {
    pub public: WindowLimit,
    pub authenticated: WindowLimit,
    pub payment: WindowLimit,
    pub admin: WindowLimit,
    #[serde(alias = "bulk-upload")]
    pub bulk_upload: WindowLimit,
}

impl TrafficClassLimits {
    /// Returns the budget for a traffic class.
    pub const fn for_class(&self, class: TrafficClass) -> &WindowLimit {
        match class {
            TrafficClass::Public => &self.public,
            TrafficClass::Authenticated => &self.authenticated,
            TrafficClass::Payment => &self.payment,
            TrafficClass::Admin => &self.admin,
            TrafficClass::BulkUpload => &self.bulk_upload,
        }
    }

    /// Longest window among all classes.
    pub fn longest_window(&self) -> Duration {
        TrafficClass::ALL
            .iter()
            .map(|class| self.for_class(*class).window)
            .max()
            .unwrap_or_default()
    }
}

impl Default for TrafficClassLimits {
    fn default() -> Self {
        const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
        Self {
            public: WindowLimit::new(1000, FIFTEEN_MINUTES),
            authenticated: WindowLimit::new(2000, FIFTEEN_MINUTES),
            payment: WindowLimit::new(50, FIFTEEN_MINUTES),
            admin: WindowLimit::new(200, FIFTEEN_MINUTES),
            bulk_upload: WindowLimit::new(20, Duration::from_secs(60 * 60)),
        }
    }
}

/// Per-key burst cap applied on top of the class budget.
#[derive(Debug, Clone, Deserialize)]
pub struct BurstConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_burst_max_requests")]
    pub max_requests: u32,

    #[serde(
        default = "default_burst_window",
        deserialize_with = "deserialize_duration"
    )]
    pub window: Duration,
}

impl BurstConfig {
    pub const fn limit(&self) -> WindowLimit {
        WindowLimit::new(self.max_requests, self.window)
    }
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_burst_max_requests(),
            window: default_burst_window(),
        }
    }
}

const fn default_burst_max_requests() -> u32 {
    10
}

const fn default_burst_window() -> Duration {
    Duration::from_secs(60)
}

/// Where sliding-window state lives.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RateLimitStoreConfig {
    /// Process-local windows.
    #[default]
    Memory,
    /// Shared windows in Valkey for multi-instance deployments.
    Valkey {
        /// Connection URL.
        url: String,
        /// Prefix applied to every window key.
        #[serde(default = "default_rate_limit_key_prefix")]
        key_prefix: String,
    },
}

fn default_rate_limit_key_prefix() -> String {
    "ultramarket:ratelimit:".to_owned()
}

/// Sliding-window rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub classes: TrafficClassLimits,

    #[serde(default)]
    pub burst: BurstConfig,

    #[serde(default)]
    pub store: RateLimitStoreConfig,

    /// How often idle keys are dropped from the window store.
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sweep_interval: Duration,

    /// Admit requests when the window store is unreachable.
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Upper bound on one window store round trip.
    #[serde(
        default = "default_store_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            classes: TrafficClassLimits::default(),
            burst: BurstConfig::default(),
            store: RateLimitStoreConfig::default(),
            sweep_interval: default_sweep_interval(),
            fail_open: true,
            store_timeout: default_store_timeout(),
        }
    }
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_store_timeout() -> Duration {
    Duration::from_millis(500)
}

/// A backend service the gateway forwards to.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Base URL, e.g. `http://orders:3004`.
    pub url: String,

    /// Payment/auth style backends whose loss makes the platform unhealthy.
    #[serde(default)]
    pub critical: bool,

    /// Default dispatch deadline for routes targeting this service.
    #[serde(
        default = "default_service_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,

    /// Path of the backend's health probe.
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

const fn default_service_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_path() -> String {
    "/health".to_owned()
}

/// One route table entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Path prefix; segments written `{name}` capture path parameters.
    pub prefix: String,

    /// Name of the backend service in `[services]`.
    pub service: String,

    /// Access requirement. Defaults to any authenticated caller.
    #[serde(default)]
    pub access: RouteAccess,

    /// Rate-limit budget; derived from `access` when omitted.
    #[serde(default)]
    pub traffic_class: Option<TrafficClass>,

    /// Drop the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,

    /// Prefix prepended to the forwarded path.
    #[serde(default)]
    pub rewrite_prefix: Option<String>,

    /// Overrides the service's dispatch deadline.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
}

/// Backend health polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Run the background poller.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(
        default = "default_health_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,

    /// Upper bound on one backend probe.
    #[serde(
        default = "default_probe_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_timeout: Duration,

    /// Consecutive failures before a backend is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Fail fast with 503 for backends last seen unhealthy.
    #[serde(default = "default_true")]
    pub skip_unhealthy_backends: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            probe_timeout: default_probe_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            skip_unhealthy_backends: true,
        }
    }
}

const fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_unhealthy_threshold() -> u32 {
    3
}

/// Browser caller configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed to call the gateway from a browser. Empty disables CORS.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Request and connection limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Maximum time to establish a backend connection.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

const fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Resilience middleware configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiddlewareConfig {
    /// Per-backend circuit breaker.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

/// Circuit breaker configuration for backend resilience.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Number of successful requests in half-open state before closing.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time before an open circuit lets a trial request through.
    #[serde(
        default = "default_reset_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_success_threshold() -> u32 {
    3
}

const fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for the Prometheus metrics endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Address to bind the metrics server to.
    #[serde(default = "default_metrics_bind_address")]
    pub bind_address: SocketAddr,

    /// HTTP path for the metrics endpoint.
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_address: default_metrics_bind_address(),
            path: default_metrics_path(),
        }
    }
}

const fn default_metrics_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}

fn default_metrics_path() -> String {
    "/metrics".to_owned()
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Parses `250ms`, `30s`, `15m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("Invalid duration: {s}");

    let (digits, scale_ms): (&str, u64) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

struct EnvVarInterpolator;

impl EnvVarInterpolator {
    fn interpolate_value(value: Value) -> Value {
        match value {
            Value::String(_, s) => Value::from(Self::interpolate_string(&s)),
            Value::Dict(tag, dict) => Value::Dict(
                tag,
                dict.into_iter()
                    .map(|(k, v)| (k, Self::interpolate_value(v)))
                    .collect(),
            ),
            Value::Array(tag, arr) => Value::Array(
                tag,
                arr.into_iter().map(Self::interpolate_value).collect(),
            ),
            other => other,
        }
    }

    /// Expands `${VAR}` and `${VAR:-fallback}`; unset variables without a fallback expand to "".
    fn interpolate_string(s: &str) -> String {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            let Some(end) = after.find('}') else {
                result.push_str(&rest[start..]);
                return result;
            };

            let expr = &after[..end];
            let (name, fallback) = match expr.split_once(":-") {
                Some((name, fallback)) => (name, Some(fallback)),
                None => (expr, None),
            };

            match std::env::var(name) {
                Ok(val) if !val.is_empty() => result.push_str(&val),
                _ => result.push_str(fallback.unwrap_or_default()),
            }

            rest = &after[end + 1..];
        }

        result.push_str(rest);
        result
    }
}

/// TOML configuration provider with environment variable interpolation.
///
/// Supports `${VAR_NAME}` and `${VAR_NAME:-default}` inside string values.
pub struct InterpolatingToml {
    content: String,
}

impl InterpolatingToml {
    /// Creates an interpolating TOML provider from a file path.
    pub fn file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|_| ConfigError::FileNotFound(path.as_ref().display().to_string()))?;
        Ok(Self { content })
    }

    /// Creates an interpolating TOML provider from a string.
    pub fn string(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl Provider for InterpolatingToml {
    fn metadata(&self) -> Metadata {
        Metadata::named("Interpolating TOML")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, FigmentError> {
        let base_data = Toml::string(&self.content).data()?;

        Ok(base_data
            .into_iter()
            .map(|(profile, dict)| {
                let dict: Dict = dict
                    .into_iter()
                    .map(|(k, v)| (k, EnvVarInterpolator::interpolate_value(v)))
                    .collect();
                (profile, dict)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    const ORDERS: &str = r#"
        [auth]
        secret = "test-secret"

        [services.orders]
        url = "http://127.0.0.1:3004"

        [[routes]]
        prefix = "/api/v1/orders"
        service = "orders"
        access = { kind = "authenticated", min_role = "customer" }
        traffic_class = "authenticated"
    "#;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn config_defaults() {
        let config = GatewayConfig::parse("").unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:8080".parse().unwrap());
        assert!(config.auth.is_none());
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.store, RateLimitStoreConfig::Memory);
        assert_eq!(config.rate_limit.classes.payment.max_requests, 50);
        assert_eq!(
            config.rate_limit.classes.bulk_upload.window,
            Duration::from_secs(3600)
        );
        assert_eq!(config.rate_limit.burst.limit().max_requests, 10);
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.limits.max_body_size, 10 * 1024 * 1024);
        assert!(config.metrics.is_none());
        assert!(config.middleware.circuit_breaker.is_none());
    }

    #[test]
    fn config_route_table() {
        let config = GatewayConfig::parse(ORDERS).unwrap();

        assert_eq!(config.routes.len(), 1);
        let route = &config.routes[0];
        assert_eq!(route.service, "orders");
        assert_eq!(route.traffic_class, Some(TrafficClass::Authenticated));
        assert_eq!(
            route.access,
            RouteAccess::Authenticated {
                min_role: Role::Customer,
                permissions: vec![],
            }
        );
        assert_eq!(
            config.services["orders"].timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn config_class_overrides_keep_other_defaults() {
        let config = GatewayConfig::parse(
            r#"
            [rate_limit.classes.payment]
            max_requests = 5
            window = "1m"

            [rate_limit.burst]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(
            config.rate_limit.classes.payment,
            WindowLimit::new(5, Duration::from_secs(60))
        );
        assert_eq!(config.rate_limit.classes.public.max_requests, 1000);
        assert!(!config.rate_limit.burst.enabled);
    }

    #[test]
    fn config_valkey_store() {
        let config = GatewayConfig::parse(
            r#"
            [rate_limit]
            store_timeout = "150ms"

            [rate_limit.store]
            type = "valkey"
            url = "redis://localhost:6379"
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.store_timeout, Duration::from_millis(150));

        assert_eq!(
            config.rate_limit.store,
            RateLimitStoreConfig::Valkey {
                url: "redis://localhost:6379".into(),
                key_prefix: "ultramarket:ratelimit:".into(),
            }
        );
    }

    #[test]
    fn missing_verification_key_is_fatal() {
        let without_auth = ORDERS.replace("[auth]\n        secret = \"test-secret\"", "");
        let err = GatewayConfig::parse(&without_auth).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let empty_secret = ORDERS.replace("test-secret", " ");
        assert!(GatewayConfig::parse(&empty_secret).is_err());
    }

    #[test]
    fn public_routes_need_no_auth() {
        let config = GatewayConfig::parse(
            r#"
            [services.products]
            url = "http://127.0.0.1:3003"

            [[routes]]
            prefix = "/api/v1/products"
            service = "products"
            access = { kind = "public" }
            "#,
        )
        .unwrap();
        assert!(config.auth.is_none());
    }

    #[test]
    fn unknown_service_is_rejected() {
        let broken = ORDERS.replace("service = \"orders\"", "service = \"billing\"");
        assert!(GatewayConfig::parse(&broken).is_err());
    }

    #[test]
    fn malformed_prefix_is_rejected() {
        let broken = ORDERS.replace("\"/api/v1/orders\"", "\"api/v1/orders\"");
        assert!(GatewayConfig::parse(&broken).is_err());
    }

    #[test]
    fn self_access_requires_placeholder() {
        let config = r#"
            [auth]
            secret = "s"

            [services.users]
            url = "http://127.0.0.1:3001"

            [[routes]]
            prefix = "/api/v1/users/{user_id}"
            service = "users"
            access = { kind = "self_access", param = "user_id" }
        "#;
        assert!(GatewayConfig::parse(config).is_ok());

        let broken = config.replace("param = \"user_id\"", "param = \"id\"");
        assert!(GatewayConfig::parse(&broken).is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = GatewayConfig::parse(
            r#"
            [rate_limit.classes.admin]
            max_requests = 0
            window = "1m"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("admin"));
    }

    #[test]
    fn backend_url_parsing() {
        assert_eq!(
            parse_backend_url("http://orders:3004").unwrap(),
            ("orders".into(), 3004, String::new())
        );
        assert_eq!(
            parse_backend_url("http://example.com/base/").unwrap(),
            ("example.com".into(), 80, "/base".into())
        );
        assert!(parse_backend_url("https://example.com").is_err());
        assert!(parse_backend_url("orders:3004").is_err());
    }

    #[test]
    fn service_name_validation() {
        assert!(validate_service_name("orders").is_ok());
        assert!(validate_service_name("user-service").is_ok());
        assert!(validate_service_name("Orders").is_err());
        assert!(validate_service_name("1orders").is_err());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name(&"a".repeat(MAX_SERVICE_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn interpolation_with_fallback() {
        std::env::set_var("ULTRAMARKET_TEST_SECRET", "from-env");
        assert_eq!(
            EnvVarInterpolator::interpolate_string("key=${ULTRAMARKET_TEST_SECRET}"),
            "key=from-env"
        );
        assert_eq!(
            EnvVarInterpolator::interpolate_string("${ULTRAMARKET_TEST_UNSET:-fallback}"),
            "fallback"
        );
        assert_eq!(
            EnvVarInterpolator::interpolate_string("${ULTRAMARKET_TEST_UNSET}"),
            ""
        );
        assert_eq!(EnvVarInterpolator::interpolate_string("${broken"), "${broken");
    }
}
