//! Out-of-process plugin ecosystem: manifests, persistent registry,
//! permission sandbox, gRPC transport, and the lifecycle supervisor.

pub mod host;
pub mod manifest;
pub mod registry;
pub mod rpc;
pub mod sandbox;
pub mod supervisor;

pub use manifest::{PluginCapability, PluginManifest};
pub use registry::{PluginRecord, RegistryStore};
pub use sandbox::{Permission, PermissionGate, PermissionSet};
pub use supervisor::{HealthState, InstanceStatus, PluginSupervisor, ValidationReport};
