//! Pool bookkeeping persisted on each AppWrapper
//!
//! After a successful scale-out the controller records, per pod group index,
//! which pool it created or reused and how many replicas the group asked for.
//! Teardown reads this record back, and other workloads read it to count
//! references on shared pools. It is stored as JSON in the
//! [`crate::POOLS_ANNOTATION`] annotation so it survives controller restarts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::MachineSetsStrategy;
use crate::Error;

/// Pool bound to one pod group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBinding {
    /// MachineSet name
    pub pool: String,
    /// Instance type the group asked for
    pub instance_type: String,
    /// Replicas the group asked for
    pub replicas: u32,
}

/// Everything a workload needs to undo its scale-out
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBookkeeping {
    /// Strategy in force when the pools were bound
    pub strategy: MachineSetsStrategy,
    /// Bindings keyed by pod group index
    #[serde(default)]
    pub entries: BTreeMap<usize, PoolBinding>,
}

impl PoolBookkeeping {
    /// Empty bookkeeping for a strategy
    pub fn new(strategy: MachineSetsStrategy) -> Self {
        Self {
            strategy,
            entries: BTreeMap::new(),
        }
    }

    /// Decode the annotation value
    pub fn decode(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(|e| {
            Error::serialization_for_kind("PoolBookkeeping", format!("invalid annotation: {e}"))
        })
    }

    /// Encode as an annotation value
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("PoolBookkeeping", e.to_string()))
    }

    /// Distinct pool names referenced by this workload
    pub fn pools(&self) -> Vec<&str> {
        let mut pools: Vec<&str> = self.entries.values().map(|b| b.pool.as_str()).collect();
        pools.sort_unstable();
        pools.dedup();
        pools
    }
}
