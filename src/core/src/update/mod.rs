//! Atomic, verified, resumable self-update of the main and helper
//! binary set.

pub mod descriptor;
pub mod engine;

pub use descriptor::{ArtifactDescriptor, ReleaseDescriptor};
pub use engine::{
    install_root_lock_path, CheckReport, Recovery, UpdateEngine, UpdateOutcome,
};
