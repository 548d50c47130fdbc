//! Declarative cross-platform package installation.
//!
//! A catalog maps package keys to variants specialised per host;
//! selection picks exactly one variant per (package, host) pair, the
//! planner computes the prerequisite closure, and the executor runs the
//! plan strictly sequentially with idempotence probes and dry-run
//! support.

pub mod catalog;
pub mod executor;
pub mod hostinfo;
pub mod methods;
pub mod plan;
pub mod select;

pub use catalog::{PackageCatalog, PackageDefinition, Variant, VersionPredicate};
pub use executor::{InstallOptions, InstallReport, Installer, StepReport, StepStatus};
pub use hostinfo::HostInfo;
pub use plan::{build_plan, InstallPlan, PlanStep};
pub use select::{select_variant, Selection};
