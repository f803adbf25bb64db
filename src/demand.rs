//! Capacity demand extraction
//!
//! Turns one AppWrapper into an ordered list of [`GroupDemand`]s, pairing the
//! i-th pod group with the i-th entry of the `orderedinstance` label. Pure and
//! deterministic; nothing here touches the API server.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::crd::{AppWrapper, AppWrapperGenericResource};
use crate::{Error, INSTANCE_TYPE_SEPARATOR, ORDERED_INSTANCE_LABEL};

/// Summed requests and limits of one pod group
///
/// Informational: the planner sizes pools by replica count, not by envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceEnvelope {
    /// Total CPU requests in millicores
    pub cpu_request_millis: u64,
    /// Total CPU limits in millicores
    pub cpu_limit_millis: u64,
    /// Total memory requests in bytes
    pub memory_request_bytes: u64,
    /// Total memory limits in bytes
    pub memory_limit_bytes: u64,
}

impl fmt::Display for ResourceEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m/{}m memory={}/{}",
            self.cpu_request_millis,
            self.cpu_limit_millis,
            self.memory_request_bytes,
            self.memory_limit_bytes
        )
    }
}

/// Capacity one pod group asks for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDemand {
    /// Position of the pod group in the workload
    pub index: usize,
    /// Instance type requested for the group
    pub instance_type: String,
    /// Machines the group needs
    pub replicas: u32,
    /// Summed resource envelope of the group's pods
    pub envelope: ResourceEnvelope,
}

/// Extract per-group demand from an AppWrapper
///
/// Fails with [`Error::MalformedPreference`] when the `orderedinstance` label
/// is absent, contains an empty entry, or lists a different number of
/// instance types than there are pod groups.
pub fn extract_demand(aw: &AppWrapper) -> Result<Vec<GroupDemand>, Error> {
    let workload = aw.workload_key()?.to_string();
    let raw = aw.ordered_instance().ok_or_else(|| {
        Error::malformed_preference(&workload, format!("missing {ORDERED_INSTANCE_LABEL} label"))
    })?;

    let instance_types: Vec<&str> = raw.split(INSTANCE_TYPE_SEPARATOR).collect();
    if let Some(position) = instance_types.iter().position(|t| t.trim().is_empty()) {
        return Err(Error::malformed_preference(
            &workload,
            format!("empty instance type at position {position} in {raw:?}"),
        ));
    }

    let groups = aw.pod_groups();
    if instance_types.len() != groups.len() {
        return Err(Error::malformed_preference(
            &workload,
            format!(
                "{} instance types for {} pod groups",
                instance_types.len(),
                groups.len()
            ),
        ));
    }

    Ok(groups
        .iter()
        .zip(instance_types)
        .enumerate()
        .map(|(index, (group, instance_type))| GroupDemand {
            index,
            instance_type: instance_type.trim().to_string(),
            replicas: group.desired_available.max(0) as u32,
            envelope: envelope_of(&workload, group),
        })
        .collect())
}

/// Total replicas across all groups
pub fn total_replicas(demand: &[GroupDemand]) -> u32 {
    demand
        .iter()
        .fold(0, |total: u32, d| total.saturating_add(d.replicas))
}

fn envelope_of(workload: &str, group: &AppWrapperGenericResource) -> ResourceEnvelope {
    let mut envelope = ResourceEnvelope::default();
    for template in &group.custom_pod_resources {
        let count = template.replicas.max(0) as u64;
        let total = |quantities: &BTreeMap<String, String>, resource: &str, scale: f64| {
            scaled_quantity(workload, quantities, resource, scale).saturating_mul(count)
        };
        envelope.cpu_request_millis = envelope
            .cpu_request_millis
            .saturating_add(total(&template.requests, "cpu", 1000.0));
        envelope.cpu_limit_millis = envelope
            .cpu_limit_millis
            .saturating_add(total(&template.limits, "cpu", 1000.0));
        envelope.memory_request_bytes = envelope
            .memory_request_bytes
            .saturating_add(total(&template.requests, "memory", 1.0));
        envelope.memory_limit_bytes = envelope
            .memory_limit_bytes
            .saturating_add(total(&template.limits, "memory", 1.0));
    }
    envelope
}

fn scaled_quantity(
    workload: &str,
    quantities: &BTreeMap<String, String>,
    resource: &str,
    scale: f64,
) -> u64 {
    let Some(raw) = quantities.get(resource) else {
        return 0;
    };
    match parse_quantity(raw) {
        Some(value) => (value * scale).round() as u64,
        None => {
            warn!(
                workload = %workload,
                resource = %resource,
                quantity = %raw,
                "Ignoring unparseable quantity in pod resources"
            );
            0
        }
    }
}

/// Parse a Kubernetes quantity string into its base-unit value
///
/// Supports decimal (`m`, `k`, `M`, `G`, `T`, `P`, `E`) and binary (`Ki` ..
/// `Ei`) suffixes as well as plain and exponent forms (`1.5`, `1e3`).
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => 10f64.powi(exp[1..].parse().ok()?),
        _ => return None,
    };
    let result = value * multiplier;
    (result >= 0.0).then_some(result)
}
