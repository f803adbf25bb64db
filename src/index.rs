//! Machine pool index
//!
//! A snapshot of the MachineSets in the managed namespace together with the
//! pool references every *other* workload recorded in its bookkeeping. The
//! planner reads nothing else, which keeps it a pure function of this
//! snapshot.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::config::MachineSetsStrategy;
use crate::crd::{AppWrapper, MachinePool, WorkloadKey};

/// A pool reference left behind by another workload's scale-out
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolReference {
    /// Workload holding the reference
    pub workload: WorkloadKey,
    /// Pod group index within that workload
    pub group_index: usize,
    /// Referenced MachineSet
    pub pool: String,
    /// Instance type the group asked for
    pub instance_type: String,
    /// Replicas the group asked for
    pub replicas: u32,
    /// Strategy the reference was made under
    pub strategy: MachineSetsStrategy,
    /// False once the workload is deleting or in a terminal state
    pub live: bool,
}

/// Outcome of looking up pools by instance type
#[derive(Debug, PartialEq)]
pub enum PoolLookup<'a> {
    /// Pools serving the instance type, in name order
    Found(Vec<&'a MachinePool>),
    /// No pool serves the instance type
    NotFound,
}

/// Pools plus peer references, as seen at the start of a planning pass
#[derive(Clone, Debug, Default)]
pub struct PoolIndex {
    pools: BTreeMap<String, MachinePool>,
    references: Vec<PoolReference>,
}

impl PoolIndex {
    /// Build the index from listed pools and workloads, excluding `self_key`
    ///
    /// Workloads whose bookkeeping cannot be decoded are skipped with a
    /// warning; their pools are then only protected by their current
    /// replica counts.
    pub fn build(
        pools: Vec<MachinePool>,
        workloads: &[AppWrapper],
        self_key: &WorkloadKey,
    ) -> Self {
        let mut references = Vec::new();
        for aw in workloads {
            let Ok(key) = aw.workload_key() else {
                continue;
            };
            if &key == self_key {
                continue;
            }
            let bookkeeping = match aw.bookkeeping() {
                Ok(Some(bookkeeping)) => bookkeeping,
                Ok(None) => continue,
                Err(e) => {
                    warn!(workload = %key, error = %e, "Skipping unreadable pool bookkeeping");
                    continue;
                }
            };
            let live = !aw.is_deleting() && !aw.is_terminal();
            references.extend(bookkeeping.entries.into_iter().map(|(group_index, binding)| {
                PoolReference {
                    workload: key.clone(),
                    group_index,
                    pool: binding.pool,
                    instance_type: binding.instance_type,
                    replicas: binding.replicas,
                    strategy: bookkeeping.strategy,
                    live,
                }
            }));
        }
        Self::from_parts(pools, references)
    }

    /// Assemble an index from already-collected parts
    pub fn from_parts(pools: Vec<MachinePool>, references: Vec<PoolReference>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.name.clone(), p)).collect(),
            references,
        }
    }

    /// Pool by name
    pub fn pool(&self, name: &str) -> Option<&MachinePool> {
        self.pools.get(name)
    }

    /// Pools serving `instance_type`
    pub fn lookup(&self, instance_type: &str) -> PoolLookup<'_> {
        let found: Vec<&MachinePool> = self
            .pools
            .values()
            .filter(|p| p.serves(instance_type))
            .collect();
        if found.is_empty() {
            PoolLookup::NotFound
        } else {
            PoolLookup::Found(found)
        }
    }

    /// Peer references to `pool`, live or not
    pub fn references_to<'a>(
        &'a self,
        pool: &'a str,
    ) -> impl Iterator<Item = &'a PoolReference> + 'a {
        self.references.iter().filter(move |r| r.pool == pool)
    }

    /// Highest demand among live peers referencing `pool`
    pub fn live_peer_max(&self, pool: &str) -> Option<u32> {
        self.references_to(pool)
            .filter(|r| r.live)
            .map(|r| r.replicas)
            .max()
    }

    /// Names of pools referenced by any peer
    pub fn referenced_pools(&self) -> BTreeSet<&str> {
        self.references.iter().map(|r| r.pool.as_str()).collect()
    }
}
