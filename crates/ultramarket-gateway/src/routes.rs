//! Route table: maps request paths to backend services and access requirements.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Role;
use crate::config::{ConfigError, GatewayConfig};

/// Rate-limit budget a route draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    Public,
    Authenticated,
    Payment,
    Admin,
    #[serde(alias = "bulk-upload")]
    BulkUpload,
}

impl TrafficClass {
    pub const ALL: [Self; 5] = [
        Self::Public,
        Self::Authenticated,
        Self::Payment,
        Self::Admin,
        Self::BulkUpload,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
            Self::Payment => "payment",
            Self::Admin => "admin",
            Self::BulkUpload => "bulk_upload",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller must prove before a route is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteAccess {
    /// Anyone, token or not.
    Public,
    /// A verified token with at least `min_role`, and one of `permissions` when listed.
    Authenticated {
        #[serde(default)]
        min_role: Role,
        #[serde(default)]
        permissions: Vec<String>,
    },
    /// A verified token whose subject equals the named path parameter, or an admin.
    SelfAccess { param: String },
}

impl Default for RouteAccess {
    fn default() -> Self {
        Self::Authenticated {
            min_role: Role::Customer,
            permissions: Vec::new(),
        }
    }
}

impl RouteAccess {
    pub const fn auth_required(&self) -> bool {
        !matches!(self, Self::Public)
    }

    /// Budget used when the route names none.
    pub const fn default_traffic_class(&self) -> TrafficClass {
        match self {
            Self::Public => TrafficClass::Public,
            Self::Authenticated {
                min_role: Role::Admin | Role::SuperAdmin,
                ..
            } => TrafficClass::Admin,
            Self::Authenticated { .. } | Self::SelfAccess { .. } => TrafficClass::Authenticated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A resolved route table entry.
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    pub prefix: String,
    segments: Vec<Segment>,
    pub service: String,
    pub access: RouteAccess,
    pub traffic_class: TrafficClass,
    pub strip_prefix: bool,
    pub rewrite_prefix: Option<String>,
    pub timeout: Duration,
}

impl RouteDescriptor {
    pub fn new(
        prefix: impl Into<String>,
        service: impl Into<String>,
        access: RouteAccess,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let prefix = prefix.into();
        let segments = parse_segments(&prefix)?;
        let traffic_class = access.default_traffic_class();

        Ok(Self {
            prefix,
            segments,
            service: service.into(),
            access,
            traffic_class,
            strip_prefix: false,
            rewrite_prefix: None,
            timeout,
        })
    }

    #[must_use]
    pub const fn with_traffic_class(mut self, class: TrafficClass) -> Self {
        self.traffic_class = class;
        self
    }

    #[must_use]
    pub fn with_rewrite(mut self, strip_prefix: bool, rewrite_prefix: Option<String>) -> Self {
        self.strip_prefix = strip_prefix;
        self.rewrite_prefix = rewrite_prefix;
        self
    }

    /// Segment-aware prefix match. Returns captured params and the unmatched tail.
    fn match_path<'p>(&self, path: &'p str) -> Option<(HashMap<String, String>, &'p str)> {
        let trimmed = path.strip_prefix('/')?;
        let mut parts = trimmed.split('/');
        let mut params = HashMap::new();
        // Byte offset just past the last consumed segment's trailing slash.
        let mut consumed = 1;

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Param(name) if !part.is_empty() => {
                    params.insert(name.clone(), part.to_owned());
                }
                _ => return None,
            }
            consumed += part.len() + 1;
        }

        let remainder = if consumed > path.len() {
            ""
        } else {
            &path[consumed - 1..]
        };
        Some((params, remainder))
    }

    fn upstream_path(&self, path: &str, remainder: &str) -> String {
        let base = if self.strip_prefix { remainder } else { path };
        let joined = match &self.rewrite_prefix {
            Some(rewrite) => format!("{}{base}", rewrite.trim_end_matches('/')),
            None => base.to_owned(),
        };

        if joined.is_empty() {
            "/".to_owned()
        } else {
            joined
        }
    }

    /// Longer prefixes first, then more literal segments.
    fn specificity(&self) -> (usize, usize) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        (self.segments.len(), literals)
    }
}

fn parse_segments(prefix: &str) -> Result<Vec<Segment>, ConfigError> {
    let Some(body) = prefix.strip_prefix('/') else {
        return Err(ConfigError::Invalid(format!(
            "route prefix '{prefix}' must start with '/'"
        )));
    };

    body.trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some("") => Err(ConfigError::Invalid(format!(
                "route prefix '{prefix}' has an unnamed placeholder"
            ))),
            Some(name) => Ok(Segment::Param(name.to_owned())),
            None if s.contains(['{', '}']) => Err(ConfigError::Invalid(format!(
                "route prefix '{prefix}' has a malformed placeholder '{s}'"
            ))),
            None => Ok(Segment::Literal(s.to_owned())),
        })
        .collect()
}

/// Outcome of resolving a path.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteDescriptor>,
    pub params: HashMap<String, String>,
    pub upstream_path: String,
}

fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Immutable, specificity-ordered set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<RouteDescriptor>>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteDescriptor>) -> Self {
        let mut routes: Vec<_> = routes.into_iter().map(Arc::new).collect();
        routes.sort_by(|a, b| b.specificity().cmp(&a.specificity()));
        Self { routes }
    }

    /// Builds the table from validated configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let routes = config
            .routes
            .iter()
            .map(|route| {
                let service = config.services.get(&route.service).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "route '{}' references unknown service '{}'",
                        route.prefix, route.service
                    ))
                })?;

                let mut descriptor = RouteDescriptor::new(
                    route.prefix.clone(),
                    route.service.clone(),
                    route.access.clone(),
                    route.timeout.unwrap_or(service.timeout),
                )?
                .with_rewrite(route.strip_prefix, route.rewrite_prefix.clone());

                if let Some(class) = route.traffic_class {
                    descriptor = descriptor.with_traffic_class(class);
                }
                Ok(descriptor)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self::new(routes))
    }

    /// Most specific route whose prefix matches `path` on segment boundaries.
    ///
    /// Paths carrying `.` or `..` segments, plain or percent-encoded, never
    /// match: a backend resolving them would escape the route's access checks.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        if has_dot_segment(path) {
            return None;
        }
        self.routes.iter().find_map(|route| {
            let (params, remainder) = route.match_path(path)?;
            Some(RouteMatch {
                route: Arc::clone(route),
                upstream_path: route.upstream_path(path, remainder),
                params,
            })
        })
    }

    pub fn routes(&self) -> &[Arc<RouteDescriptor>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route table that can be swapped at runtime without blocking readers for long.
#[derive(Debug)]
pub struct SharedRouteTable {
    current: RwLock<Arc<RouteTable>>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Snapshot used for the whole of one request.
    pub fn load(&self) -> Arc<RouteTable> {
        Arc::clone(&self.current.read())
    }

    /// Installs a new table and returns the previous one.
    pub fn swap(&self, table: RouteTable) -> Arc<RouteTable> {
        std::mem::replace(&mut *self.current.write(), Arc::new(table))
    }
}
