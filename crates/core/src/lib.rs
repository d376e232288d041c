//! `fleetops-core`: identifiers, target systems and the capability interface.
//!
//! This crate has **no threads and no IO**; the job runtime and the client
//! cache live in `fleetops-infra`.

pub mod capability;
pub mod error;
pub mod id;
pub mod target;

pub use capability::{
    ClientFactory, HealthCheck, PackageBackend, PackageDeployer, PackageRequest, ReleaseStatus,
    ResourceInspector, ResourceKind, ResourceRef,
};
pub use error::{CapabilityError, CapabilityResult};
pub use id::{EmptyJobId, JobId};
pub use target::{ConnectionConfig, TargetSystem};
