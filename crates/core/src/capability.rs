//! Capability interface implemented by the per-system client adapters.
//!
//! The job runtime never talks to an SDK directly. It calls these traits,
//! which keeps the orchestration code independent of wire formats and makes
//! every backend swappable for an in-memory double in tests.
//!
//! All traits require `Send + Sync`: one cached client is shared by every job
//! whose connection settings match, and those jobs run on different threads.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CapabilityResult;
use crate::target::ConnectionConfig;

/// Liveness probe for a constructed client.
pub trait HealthCheck: Send + Sync {
    fn health_check(&self) -> CapabilityResult<()>;
}

/// What the package deployer reports about a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub installed: bool,
    /// Backend-reported details (chart, version, revision, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ReleaseStatus {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn installed(metadata: BTreeMap<String, String>) -> Self {
        Self {
            installed: true,
            metadata,
        }
    }

    /// Version reported by the backend, if any.
    pub fn version(&self) -> Option<&str> {
        self.metadata.get("version").map(String::as_str)
    }
}

/// Install/upgrade request for one release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRequest {
    /// Release name.
    pub name: String,
    /// Chart reference or repository URL.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub namespace: String,
    /// Opaque values document forwarded to the backend.
    #[serde(default)]
    pub values: serde_json::Value,
}

impl PackageRequest {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            version: None,
            namespace: namespace.into(),
            values: serde_json::Value::Null,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_values(mut self, values: serde_json::Value) -> Self {
        self.values = values;
        self
    }
}

/// Package-deployment operations.
///
/// A successful `install`/`upgrade`/`uninstall` only means the backend
/// accepted the change; callers confirm it through `release_status` and
/// [`ResourceInspector`].
pub trait PackageDeployer: HealthCheck {
    fn release_status(&self, name: &str, namespace: &str) -> CapabilityResult<ReleaseStatus>;

    fn install(&self, request: &PackageRequest) -> CapabilityResult<()>;

    fn upgrade(&self, request: &PackageRequest) -> CapabilityResult<()>;

    fn uninstall(&self, name: &str, namespace: &str, dry_run: bool) -> CapabilityResult<()>;
}

/// Kind of orchestration resource returned by [`ResourceInspector`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Pod,
    ConfigMap,
    Secret,
}

/// Minimal reference to an orchestration resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Raw resource queries against the container-orchestration API.
///
/// `name` is a substring filter; an empty filter returns everything in the
/// namespace.
pub trait ResourceInspector: Send + Sync {
    fn pods(&self, namespace: &str, name: &str) -> CapabilityResult<Vec<ResourceRef>>;

    fn config_maps(&self, namespace: &str, name: &str) -> CapabilityResult<Vec<ResourceRef>>;

    fn secrets(&self, namespace: &str, name: &str) -> CapabilityResult<Vec<ResourceRef>>;
}

/// Client able to deploy packages and inspect the resources they create.
pub trait PackageBackend: PackageDeployer + ResourceInspector {}

impl<T> PackageBackend for T where T: PackageDeployer + ResourceInspector {}

/// Builds clients from connection settings.
///
/// Construction is the expensive step (TLS handshake, capability discovery,
/// credential resolution); the cache calls this at most once per distinct
/// configuration.
pub trait ClientFactory<C: ?Sized>: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> CapabilityResult<Arc<C>>;
}

impl<C, F> ClientFactory<C> for F
where
    C: ?Sized,
    F: Fn(&ConnectionConfig) -> CapabilityResult<Arc<C>> + Send + Sync,
{
    fn connect(&self, config: &ConnectionConfig) -> CapabilityResult<Arc<C>> {
        self(config)
    }
}
