//! InstaScale - on-demand machine pools for AppWrapper batch workloads
//!
//! InstaScale watches AppWrappers and grows or shrinks OpenShift MachineSets
//! so that the instance types a workload asks for exist before its pods are
//! placed. When the workload completes or is deleted the capacity it caused
//! is released again.
//!
//! # Architecture
//!
//! Each reconcile pass is observe-plan-act:
//! - Demand is extracted from the AppWrapper's pod groups and its
//!   `orderedinstance` label
//! - A pool index is built from live MachineSets and the bookkeeping other
//!   workloads left behind
//! - A pure planner turns demand plus index into pool actions, enforcing the
//!   scale-out ceiling
//! - The controller applies the plan with optimistic concurrency and
//!   persists bookkeeping for teardown
//!
//! # Modules
//!
//! - [`crd`] - AppWrapper and MachineSet resource models
//! - [`demand`] - Capacity demand extraction
//! - [`index`] - Pool index and cross-workload references
//! - [`planner`] - Scale-out and teardown planning
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Controller configuration
//! - [`retry`] - Backoff, timeouts and failure tracking
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod demand;
pub mod error;
pub mod events;
pub mod index;
pub mod planner;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known labels and annotations
// =============================================================================

/// AppWrapper label listing one instance type per pod group
pub const ORDERED_INSTANCE_LABEL: &str = "orderedinstance";

/// Separator between instance types in [`ORDERED_INSTANCE_LABEL`]
///
/// Label values cannot contain commas, so the list is underscore-separated.
pub const INSTANCE_TYPE_SEPARATOR: char = '_';

/// Finalizer guaranteeing teardown runs before an AppWrapper disappears
pub const FINALIZER: &str = "instascale.codeflare.dev/finalizer";

/// AppWrapper annotation holding [`crd::PoolBookkeeping`] as JSON
pub const POOLS_ANNOTATION: &str = "instascale.codeflare.dev/machine-pools";

/// AppWrapper annotation holding the last [`crd::Condition`] as JSON
pub const CONDITION_ANNOTATION: &str = "instascale.codeflare.dev/condition";

/// MachineSet annotation naming the owner of a dedicated pool (`<ns>/<name>`)
pub const OWNER_ANNOTATION: &str = "instascale.codeflare.dev/owner";

/// MachineSet label marking pools created by InstaScale
pub const MANAGED_LABEL: &str = "instascale.codeflare.dev/managed";

/// MachineSet label overriding the instance type read from the provider spec
pub const INSTANCE_TYPE_LABEL: &str = "instascale.codeflare.dev/instance-type";

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "instascale-controller";

/// Condition type recorded on AppWrappers
pub const SCALED_OUT_CONDITION: &str = "ScaledOut";
