//! Storage routing for the timeline.
//!
//! A route binds `(resource_kind, tenant_id, env, project_id)` to a concrete
//! backend. Resolution never falls back to a default: an unrouted tuple is a
//! configuration error surfaced at store construction.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use timeline_protocol::{TimelineError, TimelineResult};
use tracing::{debug, warn};

/// Matches any tenant, env or project in a route record.
pub const WILDCARD: &str = "*";

/// Environments where local (in-memory, filesystem) backends are allowed.
pub const LAB_ENVS: &[&str] = &["lab", "dev", "local", "test"];

pub fn is_lab_env(env: &str) -> bool {
    LAB_ENVS.contains(&env)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    pub const TIMELINE: &'static str = "timeline";

    pub fn timeline() -> Self {
        Self(Self::TIMELINE.to_owned())
    }

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_database() -> String {
    "(default)".to_owned()
}

fn default_collection_prefix() -> String {
    "timeline".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStoreConfig {
    pub project_id: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    /// Overrides the public REST endpoint (emulators, proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Name of the env var holding a bearer access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,
}

impl DocumentStoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: default_database(),
            collection_prefix: default_collection_prefix(),
            endpoint: None,
            access_token_env: None,
        }
    }
}

/// Concrete backend selected by a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend_type", rename_all = "snake_case")]
pub enum BackendDescriptor {
    InMemory,
    Filesystem { base_path: PathBuf },
    DocumentStore(DocumentStoreConfig),
}

impl BackendDescriptor {
    pub fn backend_type(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::Filesystem { .. } => "filesystem",
            Self::DocumentStore(_) => "document_store",
        }
    }

    /// Local backends are for development and lab environments only.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::InMemory | Self::Filesystem { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub resource_kind: ResourceKind,
    pub tenant_id: String,
    pub env: String,
    pub project_id: String,
    pub backend: BackendDescriptor,
}

impl RouteRecord {
    pub fn new(
        resource_kind: ResourceKind,
        tenant_id: impl Into<String>,
        env: impl Into<String>,
        project_id: impl Into<String>,
        backend: BackendDescriptor,
    ) -> Self {
        Self {
            resource_kind,
            tenant_id: tenant_id.into(),
            env: env.into(),
            project_id: project_id.into(),
            backend,
        }
    }

    /// `None` when the record does not apply; otherwise its specificity.
    /// Tenant-exact beats project-exact beats env-exact.
    fn specificity(
        &self,
        resource_kind: &str,
        tenant_id: &str,
        env: &str,
        project_id: &str,
    ) -> Option<(bool, bool, bool)> {
        if self.resource_kind.as_str() != resource_kind {
            return None;
        }
        let tenant = field_match(&self.tenant_id, tenant_id)?;
        let project = field_match(&self.project_id, project_id)?;
        let env = field_match(&self.env, env)?;
        Some((tenant, project, env))
    }
}

/// `Some(true)` exact, `Some(false)` wildcard, `None` no match.
fn field_match(pattern: &str, actual: &str) -> Option<bool> {
    if pattern == WILDCARD {
        Some(false)
    } else if pattern == actual {
        Some(true)
    } else {
        None
    }
}

type RouteKey = (ResourceKind, String, String, String);

/// Route records in declaration order. Re-declaring a tuple replaces the
/// earlier backend in place.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: IndexMap<RouteKey, RouteRecord>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, route: RouteRecord) -> Self {
        self.insert(route);
        self
    }

    pub fn insert(&mut self, route: RouteRecord) {
        let key = (
            route.resource_kind.clone(),
            route.tenant_id.clone(),
            route.env.clone(),
            route.project_id.clone(),
        );
        if self.routes.insert(key, route).is_some() {
            warn!("route redeclared; later backend replaces earlier one");
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = RouteRecord>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.insert(record);
        }
        table
    }

    /// Parse a JSON array of route records.
    pub fn from_json_str(raw: &str) -> TimelineResult<Self> {
        let records: Vec<RouteRecord> = serde_json::from_str(raw)?;
        Ok(Self::from_records(records))
    }

    pub fn load(path: impl AsRef<Path>) -> TimelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            TimelineError::Storage(format!("failed reading routes {path:?}: {error}"))
        })?;
        let table = Self::from_json_str(&raw)?;
        debug!(path = %path.display(), routes = table.len(), "route table loaded");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &RouteRecord> {
        self.routes.values()
    }
}

#[derive(Debug, Clone)]
pub struct RoutingResolver {
    table: RouteTable,
}

impl RoutingResolver {
    pub fn new(table: RouteTable) -> Self {
        Self { table }
    }

    /// Most specific matching backend, or nothing.
    pub fn resolve(
        &self,
        resource_kind: &ResourceKind,
        tenant_id: &str,
        env: &str,
        project_id: &str,
    ) -> Option<BackendDescriptor> {
        let mut best: Option<((bool, bool, bool), &RouteRecord)> = None;
        for record in self.table.records() {
            let Some(score) =
                record.specificity(resource_kind.as_str(), tenant_id, env, project_id)
            else {
                continue;
            };
            // Strictly greater keeps the earliest declaration on ties.
            if best.is_none_or(|(current, _)| score > current) {
                best = Some((score, record));
            }
        }
        best.map(|(_, record)| record.backend.clone())
    }

    /// Like [`Self::resolve`], but absence is an error and local backends are
    /// refused outside lab environments.
    pub fn require(
        &self,
        resource_kind: &ResourceKind,
        tenant_id: &str,
        env: &str,
        project_id: &str,
    ) -> TimelineResult<BackendDescriptor> {
        let backend = self
            .resolve(resource_kind, tenant_id, env, project_id)
            .ok_or_else(|| TimelineError::MissingRoute {
                resource_kind: resource_kind.to_string(),
                tenant_id: tenant_id.to_owned(),
                env: env.to_owned(),
                project_id: project_id.to_owned(),
            })?;

        if backend.is_local() && !is_lab_env(env) {
            return Err(TimelineError::BackendRefused {
                backend: backend.backend_type().to_owned(),
                env: env.to_owned(),
            });
        }

        debug!(
            resource_kind = %resource_kind,
            tenant_id,
            env,
            project_id,
            backend = backend.backend_type(),
            "route resolved"
        );
        Ok(backend)
    }
}
