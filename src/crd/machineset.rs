//! MachineSet view used as the machine pool abstraction
//!
//! MachineSets (`machine.openshift.io/v1beta1`) are read and written as
//! `DynamicObject`s; only the handful of fields InstaScale cares about are
//! lifted into [`MachinePool`]. New pools are cloned from an existing
//! MachineSet so that provider-specific configuration (AMI, subnet, zone)
//! comes from the cluster rather than from InstaScale.

use std::collections::BTreeMap;

use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::types::WorkloadKey;
use crate::{Error, INSTANCE_TYPE_LABEL, MANAGED_LABEL, OWNER_ANNOTATION};

/// Label tying Machines to their MachineSet
pub const MACHINESET_SELECTOR_LABEL: &str = "machine.openshift.io/cluster-api-machineset";

/// Provider-spec fields that carry the instance type (AWS, Azure, GCP)
const PROVIDER_INSTANCE_FIELDS: [&str; 3] = ["instanceType", "vmSize", "machineType"];

/// Maximum length of a name that is also used as a label value
const MAX_NAME_LEN: usize = 63;

/// Hex digits of the sha256 suffix on generated pool names
const HASH_SUFFIX_LEN: usize = 8;

/// ApiResource for OpenShift MachineSets
pub fn machineset_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("machine.openshift.io", "v1beta1", "MachineSet"),
        "machinesets",
    )
}

/// Snapshot of one machine pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachinePool {
    /// MachineSet name
    pub name: String,
    /// MachineSet namespace
    pub namespace: String,
    /// Instance type served by the pool, if it could be determined
    pub instance_type: Option<String>,
    /// Desired replicas (`spec.replicas`)
    pub replicas: u32,
    /// Ready replicas reported by the machine API
    pub ready_replicas: u32,
    /// Available replicas reported by the machine API
    pub available_replicas: u32,
    /// Resource version used as the optimistic-concurrency precondition
    pub resource_version: Option<String>,
    /// Workload owning a dedicated pool
    pub owner: Option<WorkloadKey>,
}

impl MachinePool {
    /// Lift the fields InstaScale needs out of a MachineSet
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        let spec = obj.data.get("spec");
        let status = obj.data.get("status");
        let count = |v: Option<&Value>, field: &str| {
            v.and_then(|v| v.get(field))
                .and_then(Value::as_u64)
                .map(|n| n as u32)
                .unwrap_or(0)
        };

        Self {
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            instance_type: instance_type_of(obj),
            replicas: count(spec, "replicas"),
            ready_replicas: count(status, "readyReplicas"),
            available_replicas: count(status, "availableReplicas"),
            resource_version: obj.resource_version(),
            owner: obj
                .annotations()
                .get(OWNER_ANNOTATION)
                .and_then(|v| WorkloadKey::parse(v)),
        }
    }

    /// True if the pool was created for a single workload
    pub fn is_dedicated(&self) -> bool {
        self.owner.is_some()
    }

    /// True if the pool serves `instance_type`
    pub fn serves(&self, instance_type: &str) -> bool {
        self.instance_type.as_deref() == Some(instance_type)
    }

    /// True once every desired machine is available
    pub fn is_settled(&self) -> bool {
        self.available_replicas >= self.replicas
    }
}

/// Resolve the instance type of a MachineSet
///
/// The InstaScale label wins; otherwise the provider spec is inspected.
pub fn instance_type_of(obj: &DynamicObject) -> Option<String> {
    if let Some(label) = obj.labels().get(INSTANCE_TYPE_LABEL) {
        return Some(label.clone());
    }
    let provider = obj
        .data
        .pointer("/spec/template/spec/providerSpec/value")?;
    PROVIDER_INSTANCE_FIELDS
        .iter()
        .find_map(|field| provider.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Request to create a pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPool {
    /// Name of the new MachineSet
    pub name: String,
    /// Instance type it must serve
    pub instance_type: String,
    /// Initial desired replicas
    pub replicas: u32,
    /// Owning workload for dedicated pools
    pub owner: Option<WorkloadKey>,
}

/// Name of the dedicated pool for one pod group of a workload
///
/// The readable part is lossy (case, punctuation, `-` inside names), so the
/// name always ends in a hash of the exact workload, group and instance type.
pub fn dedicated_pool_name(key: &WorkloadKey, group_index: usize, instance_type: &str) -> String {
    let readable = format!(
        "{}-{}-{}-{}",
        key.name, key.namespace, group_index, instance_type
    );
    hashed_dns_label(&readable, &format!("{key}#{group_index}#{instance_type}"))
}

/// Name of the shared pool created for an instance type under the reuse strategy
pub fn shared_pool_name(instance_type: &str) -> String {
    hashed_dns_label(&format!("instascale-{instance_type}"), instance_type)
}

/// DNS-1123 label made of a sanitized `readable` prefix and a hash of `seed`
fn hashed_dns_label(readable: &str, seed: &str) -> String {
    let mut prefix: String = readable
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while prefix.contains("--") {
        prefix = prefix.replace("--", "-");
    }
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    let suffix = &digest[..HASH_SUFFIX_LEN];

    let max_prefix = MAX_NAME_LEN - HASH_SUFFIX_LEN - 1;
    let prefix = prefix.get(..max_prefix).unwrap_or(&prefix).trim_matches('-');
    if prefix.is_empty() {
        return format!("pool-{suffix}");
    }
    format!("{prefix}-{suffix}")
}

/// Pick the MachineSet a new pool is cloned from
///
/// Shared pools serving the same instance type are preferred, then any shared
/// pool, then anything at all.
pub fn select_template<'a>(
    candidates: &'a [DynamicObject],
    instance_type: &str,
) -> Option<&'a DynamicObject> {
    let shared = |obj: &&DynamicObject| !obj.annotations().contains_key(OWNER_ANNOTATION);
    candidates
        .iter()
        .filter(shared)
        .find(|obj| instance_type_of(obj).as_deref() == Some(instance_type))
        .or_else(|| candidates.iter().find(shared))
        .or_else(|| candidates.first())
}

/// Build a new MachineSet from `template`
pub fn pool_from_template(
    template: &DynamicObject,
    request: &NewPool,
    namespace: &str,
) -> Result<DynamicObject, Error> {
    let mut data = template.data.clone();
    let root = data
        .as_object_mut()
        .ok_or_else(|| Error::serialization_for_kind("MachineSet", "template is not an object"))?;
    root.remove("status");

    set_path(&mut data, &["spec", "replicas"], json!(request.replicas));
    set_path(
        &mut data,
        &["spec", "selector", "matchLabels", MACHINESET_SELECTOR_LABEL],
        json!(request.name),
    );
    set_path(
        &mut data,
        &["spec", "template", "metadata", "labels", MACHINESET_SELECTOR_LABEL],
        json!(request.name),
    );

    let provider_path = ["spec", "template", "spec", "providerSpec", "value"];
    let field = data
        .pointer("/spec/template/spec/providerSpec/value")
        .and_then(|provider| {
            PROVIDER_INSTANCE_FIELDS
                .iter()
                .find(|f| provider.get(**f).is_some())
        })
        .copied()
        .unwrap_or("instanceType");
    let mut path = provider_path.to_vec();
    path.push(field);
    set_path(&mut data, &path, json!(request.instance_type));

    let mut labels: BTreeMap<String, String> = template.labels().clone();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(
        INSTANCE_TYPE_LABEL.to_string(),
        request.instance_type.clone(),
    );

    let mut annotations = BTreeMap::new();
    if let Some(owner) = &request.owner {
        annotations.insert(OWNER_ANNOTATION.to_string(), owner.to_string());
    }

    let mut obj = DynamicObject::new(&request.name, &machineset_api_resource()).within(namespace);
    obj.metadata.labels = Some(labels);
    obj.metadata.annotations = Some(annotations);
    obj.data = data;
    Ok(obj)
}

/// Set a nested JSON field, creating intermediate objects as needed
fn set_path(value: &mut Value, path: &[&str], new: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for key in parents {
        if !current.get(*key).is_some_and(Value::is_object) {
            current[*key] = json!({});
        }
        current = &mut current[*key];
    }
    current[*last] = new;
}
