//! Package deployment as tracked background jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use fleetops_core::{
    CapabilityError, CapabilityResult, ClientFactory, ConnectionConfig, JobId, PackageBackend,
    PackageRequest, ResourceInspector, TargetSystem,
};

use super::{Orchestrator, ServiceError};
use crate::cache::{CacheConfig, CacheKey, CacheStats, ClientCache, DetailedCacheStats};
use crate::jobs::{Condition, JobContext, JobFailure, PollOutcome};

/// Install, upgrade and uninstall releases through a cached package client.
///
/// Each mutation returns a job id right away; the job retries the backend
/// call and then polls until the change is visible either in the release
/// status or in the raw resource listing.
pub struct PackageService {
    orchestrator: Arc<Orchestrator>,
    factory: Arc<dyn ClientFactory<dyn PackageBackend>>,
    cache: ClientCache<dyn PackageBackend>,
}

impl std::fmt::Debug for PackageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageService")
            .field("orchestrator", &self.orchestrator)
            .field("cache", &self.cache)
            .finish()
    }
}

impl PackageService {
    pub fn new<F>(orchestrator: Arc<Orchestrator>, factory: F, cache: CacheConfig) -> Self
    where
        F: ClientFactory<dyn PackageBackend> + 'static,
    {
        Self {
            orchestrator,
            factory: Arc::new(factory),
            cache: ClientCache::new(cache),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn cache_key(&self, conn: &ConnectionConfig) -> Result<CacheKey, ServiceError> {
        Ok(CacheKey::for_connection(conn)?)
    }

    fn client(&self, conn: &ConnectionConfig) -> Result<Arc<dyn PackageBackend>, ServiceError> {
        if conn.target != TargetSystem::Packages {
            return Err(CapabilityError::rejected(format!(
                "{} connection cannot deploy packages",
                conn.target
            ))
            .into());
        }
        let key = self.cache_key(conn)?;
        let client = self.cache.get_or_create(&key, || {
            info!(key = %key, endpoint = %conn.endpoint, "connecting package backend");
            self.factory.connect(conn)
        })?;
        Ok(client)
    }

    pub fn install(
        &self,
        conn: &ConnectionConfig,
        request: PackageRequest,
    ) -> Result<JobId, ServiceError> {
        let client = self.client(conn)?;
        let metadata = job_metadata("install", &request.name, &request.namespace, conn);
        self.orchestrator.spawn(None, metadata, move |ctx| {
            install_release(ctx, client.as_ref(), &request)
        })
    }

    pub fn upgrade(
        &self,
        conn: &ConnectionConfig,
        request: PackageRequest,
    ) -> Result<JobId, ServiceError> {
        let client = self.client(conn)?;
        let metadata = job_metadata("upgrade", &request.name, &request.namespace, conn);
        self.orchestrator.spawn(None, metadata, move |ctx| {
            upgrade_release(ctx, client.as_ref(), &request)
        })
    }

    /// A dry run only asks the backend to validate the removal; the job
    /// completes without polling.
    pub fn uninstall(
        &self,
        conn: &ConnectionConfig,
        name: &str,
        namespace: &str,
        dry_run: bool,
    ) -> Result<JobId, ServiceError> {
        let client = self.client(conn)?;
        let mut metadata = job_metadata("uninstall", name, namespace, conn);
        metadata.insert("dry_run".to_string(), dry_run.to_string());
        let (name, namespace) = (name.to_string(), namespace.to_string());
        self.orchestrator.spawn(None, metadata, move |ctx| {
            uninstall_release(ctx, client.as_ref(), &name, &namespace, dry_run)
        })
    }

    /// Synchronous liveness check on the (cached) client.
    pub fn health_check(&self, conn: &ConnectionConfig) -> Result<(), ServiceError> {
        self.client(conn)?.health_check()?;
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn detailed_cache_stats(&self) -> DetailedCacheStats {
        self.cache.detailed_stats()
    }

    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup()
    }

    pub fn clean_cache_by_key(&self, key: &CacheKey) -> bool {
        self.cache.clean_by_key(key)
    }

    pub fn clean_cache_by_pattern(&self, pattern: &str) -> usize {
        self.cache.clean_by_pattern(pattern)
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }
}

fn job_metadata(
    operation: &str,
    release: &str,
    namespace: &str,
    conn: &ConnectionConfig,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("operation".to_string(), operation.to_string()),
        ("release".to_string(), release.to_string()),
        ("namespace".to_string(), namespace.to_string()),
        ("target".to_string(), conn.target.to_string()),
    ])
}

/// Any pod, config map or secret whose name mentions the release.
fn resources_present<B>(client: &B, namespace: &str, release: &str) -> CapabilityResult<bool>
where
    B: ResourceInspector + ?Sized,
{
    Ok(!client.pods(namespace, release)?.is_empty()
        || !client.config_maps(namespace, release)?.is_empty()
        || !client.secrets(namespace, release)?.is_empty())
}

fn summary(operation: &str, release: &str, namespace: &str, outcome: PollOutcome) -> serde_json::Value {
    json!({
        "operation": operation,
        "release": release,
        "namespace": namespace,
        "checks": outcome.checks,
        "elapsed_ms": outcome.elapsed.as_millis() as u64,
    })
}

fn install_release(
    ctx: &JobContext,
    client: &dyn PackageBackend,
    request: &PackageRequest,
) -> Result<serde_json::Value, JobFailure> {
    let (name, namespace) = (request.name.as_str(), request.namespace.as_str());
    ctx.log(format!("installing {name} from {} into {namespace}", request.source));
    ctx.retry(&format!("install {name}"), || client.install(request))?;

    ctx.progress(60, format!("confirming {name} is installed"));
    let mut condition = Condition::new(format!("release {name} installed"))
        .probe("release status", || {
            Ok(client.release_status(name, namespace)?.installed)
        })
        .probe("release resources", || resources_present(client, namespace, name));
    let outcome = ctx.wait_until(&mut condition)?;

    Ok(summary("install", name, namespace, outcome))
}

fn upgrade_release(
    ctx: &JobContext,
    client: &dyn PackageBackend,
    request: &PackageRequest,
) -> Result<serde_json::Value, JobFailure> {
    let (name, namespace) = (request.name.as_str(), request.namespace.as_str());
    let wanted = request.version.as_deref();
    ctx.log(format!(
        "upgrading {name} in {namespace} to {}",
        wanted.unwrap_or("latest")
    ));
    ctx.retry(&format!("upgrade {name}"), || client.upgrade(request))?;

    ctx.progress(60, format!("confirming {name} is upgraded"));
    let mut condition = Condition::new(format!("release {name} upgraded"))
        .probe("release version", || {
            let status = client.release_status(name, namespace)?;
            Ok(status.installed && wanted.is_none_or(|v| status.version() == Some(v)))
        })
        .probe("release resources", || resources_present(client, namespace, name));
    let outcome = ctx.wait_until(&mut condition)?;

    Ok(summary("upgrade", name, namespace, outcome))
}

fn uninstall_release(
    ctx: &JobContext,
    client: &dyn PackageBackend,
    name: &str,
    namespace: &str,
    dry_run: bool,
) -> Result<serde_json::Value, JobFailure> {
    ctx.log(format!(
        "uninstalling {name} from {namespace}{}",
        if dry_run { " (dry run)" } else { "" }
    ));
    ctx.retry(&format!("uninstall {name}"), || {
        client.uninstall(name, namespace, dry_run)
    })?;

    if dry_run {
        ctx.log("dry run: nothing removed");
        return Ok(json!({
            "operation": "uninstall",
            "release": name,
            "namespace": namespace,
            "dry_run": true,
            "checks": 0,
        }));
    }

    ctx.progress(60, format!("confirming {name} is removed"));
    let mut condition = Condition::new(format!("release {name} removed"))
        .probe("release status", || {
            Ok(!client.release_status(name, namespace)?.installed)
        })
        .probe("release resources", || {
            resources_present(client, namespace, name).map(|present| !present)
        });
    let outcome = ctx.wait_until(&mut condition)?;

    Ok(summary("uninstall", name, namespace, outcome))
}
