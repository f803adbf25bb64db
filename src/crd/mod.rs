//! Resource models for InstaScale
//!
//! The AppWrapper CRD is owned by the batch dispatcher and MachineSets by the
//! OpenShift machine API; this module only models the parts InstaScale reads
//! and writes.

mod appwrapper;
mod bookkeeping;
mod machineset;
mod types;

pub use appwrapper::{
    AppWrapper, AppWrapperGenericResource, AppWrapperResourceList, AppWrapperSpec,
    AppWrapperState, AppWrapperStatus, CustomPodResourceTemplate,
};
pub use bookkeeping::{PoolBinding, PoolBookkeeping};
pub use machineset::{
    dedicated_pool_name, instance_type_of, machineset_api_resource, pool_from_template,
    select_template, shared_pool_name, MachinePool, NewPool, MACHINESET_SELECTOR_LABEL,
};
pub use types::{Condition, ConditionStatus, WorkloadKey};
