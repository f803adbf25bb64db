//! Controller implementation for AppWrappers
//!
//! The reconciler follows the Kubernetes controller pattern: observe the
//! workload, plan against a fresh snapshot of the machine pools, apply, and
//! record what was done on the workload itself.

mod appwrapper;
mod client;
mod teardown;

pub use appwrapper::{
    error_policy, reconcile, Context, ContextBuilder, ReconcilePhase, MAX_REPLANS, REPLAN_DELAY,
};
pub use client::{
    KubeMachinePoolClient, KubeWorkloadClient, MachinePoolClient, WorkloadClient,
};
pub use teardown::{apply_teardown, release_all};

#[cfg(test)]
pub use client::{MockMachinePoolClient, MockWorkloadClient};
