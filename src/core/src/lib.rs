//! # Portunix Core
//!
//! Cross-platform developer-environment and fleet-management engine.
//!
//! ## Architecture
//!
//! - **Dispatcher**: Git-style routing to co-located helper binaries
//! - **Plugin Supervisor**: lifecycle, health, and gRPC transport for
//!   out-of-process plugins
//! - **Self-Update**: atomic, verified, resumable replacement of the
//!   main + helper binary set with rollback
//! - **Installer**: declarative package installation with per-host
//!   variant selection and dependency-ordered plans
//! - **Providers**: one lifecycle-and-I/O surface over Docker, Podman,
//!   QEMU, VirtualBox, and a local sandbox
//! - **Telemetry**: structured logging infrastructure

pub mod archive;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod fsutil;
pub mod install;
pub mod lockfile;
pub mod plugins;
pub mod process;
pub mod providers;
pub mod services;
pub mod telemetry;
pub mod update;
pub mod version;

pub use error::{ErrorCode, ErrorKind, PortunixError, Result};
pub use services::Services;

/// Whether `PORTUNIX_DEBUG` asks for verbose diagnostics.
pub fn debug_enabled() -> bool {
    match std::env::var("PORTUNIX_DEBUG") {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false" && value != "no"
        }
        Err(_) => false,
    }
}

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatch::{dispatch, Dispatch, HelperDescriptor, HELPERS};
    pub use crate::error::{ErrorCode, ErrorKind, PortunixError, Result};
    pub use crate::install::{
        HostInfo, InstallOptions, InstallPlan, InstallReport, Installer, PackageCatalog,
    };
    pub use crate::plugins::{
        HealthState, InstanceStatus, PluginManifest, PluginRecord, PluginSupervisor,
    };
    pub use crate::providers::{
        EnvState, EnvironmentProvider, EnvironmentSpec, ProviderManager,
    };
    pub use crate::services::Services;
    pub use crate::update::{UpdateEngine, UpdateOutcome};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_debug_flag_parsing() {
        // Uses a scoped variable name to avoid cross-test interference.
        std::env::remove_var("PORTUNIX_DEBUG");
        assert!(!super::debug_enabled());
        std::env::set_var("PORTUNIX_DEBUG", "1");
        assert!(super::debug_enabled());
        std::env::set_var("PORTUNIX_DEBUG", "false");
        assert!(!super::debug_enabled());
        std::env::remove_var("PORTUNIX_DEBUG");
    }
}
