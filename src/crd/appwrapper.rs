//! AppWrapper Custom Resource Definition
//!
//! The AppWrapper CRD belongs to the batch dispatcher. InstaScale only models
//! the fields it reads (pod groups, the `orderedinstance` label, the
//! dispatcher-owned state) and writes nothing but annotations and its
//! finalizer.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::bookkeeping::PoolBookkeeping;
use super::types::{Condition, WorkloadKey};
use crate::{Error, CONDITION_ANNOTATION, FINALIZER, ORDERED_INSTANCE_LABEL, POOLS_ANNOTATION};

/// Desired state of an AppWrapper, as written by the submitter
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workload.codeflare.dev",
    version = "v1beta1",
    kind = "AppWrapper",
    plural = "appwrappers",
    shortname = "aw",
    status = "AppWrapperStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct AppWrapperSpec {
    /// Aggregated pod groups of the workload
    #[serde(default)]
    pub resources: AppWrapperResourceList,
}

/// Pod groups wrapped by an AppWrapper
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AppWrapperResourceList {
    /// Ordered pod groups, one per entry of the `orderedinstance` label
    #[serde(rename = "GenericItems", default)]
    pub generic_items: Vec<AppWrapperGenericResource>,
}

/// One pod group of a workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AppWrapperGenericResource {
    /// Number of pods the dispatcher needs available for this group
    #[serde(rename = "desiredAvailable", default)]
    pub desired_available: i32,

    /// Shapes of the pods in this group
    #[serde(rename = "custompodresources", default)]
    pub custom_pod_resources: Vec<CustomPodResourceTemplate>,
}

/// Resource shape of one kind of pod within a group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CustomPodResourceTemplate {
    /// Number of pods with this shape
    #[serde(default)]
    pub replicas: i32,

    /// Resource requests as Kubernetes quantities (e.g. `cpu: 250m`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Resource limits as Kubernetes quantities
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Dispatcher-owned lifecycle state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppWrapperState {
    /// Submitted, waiting for dispatch
    #[default]
    Pending,
    /// Dispatched and running
    Running,
    /// All pods finished successfully
    Completed,
    /// The workload failed
    Failed,
    /// The dispatcher removed the workload
    Deleted,
    /// Any state this controller does not know about
    #[serde(other)]
    Unknown,
}

impl AppWrapperState {
    /// True once the workload no longer needs capacity
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deleted)
    }
}

/// Status for an AppWrapper (written by the dispatcher)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AppWrapperStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: AppWrapperState,
}

impl AppWrapper {
    /// Namespace-qualified identity
    pub fn workload_key(&self) -> Result<WorkloadKey, Error> {
        let namespace = self
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation_for_field("metadata.namespace", "missing namespace"))?;
        Ok(WorkloadKey::new(namespace, self.name_any()))
    }

    /// Raw `orderedinstance` label, if set
    pub fn ordered_instance(&self) -> Option<&str> {
        self.labels().get(ORDERED_INSTANCE_LABEL).map(String::as_str)
    }

    /// Pod groups in declaration order
    pub fn pod_groups(&self) -> &[AppWrapperGenericResource] {
        &self.spec.resources.generic_items
    }

    /// Dispatcher state, `Pending` when no status was written yet
    pub fn state(&self) -> AppWrapperState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    /// True once the workload has completed, failed or been removed by the dispatcher
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// True once deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if the InstaScale finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Bookkeeping persisted by a previous scale-out
    pub fn bookkeeping(&self) -> Result<Option<PoolBookkeeping>, Error> {
        match self.annotations().get(POOLS_ANNOTATION) {
            Some(raw) => PoolBookkeeping::decode(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Condition last recorded by InstaScale
    pub fn instascale_condition(&self) -> Option<Condition> {
        self.annotations()
            .get(CONDITION_ANNOTATION)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}
