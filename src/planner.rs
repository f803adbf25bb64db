//! Scale-out and teardown planning
//!
//! Pure decision logic: given a workload's demand, a [`PoolIndex`] snapshot,
//! the configured strategy and the scale-out ceiling, decide which pools to
//! create, which to scale and which to leave alone. The inverse operation,
//! [`plan_teardown`], decides what releasing a workload's bindings does to
//! each pool.
//!
//! Nothing here performs I/O; the controller applies the result.

use std::collections::BTreeMap;

use crate::config::{InstaScaleConfig, MachineSetsStrategy, SharedPoolShrink};
use crate::crd::{
    dedicated_pool_name, shared_pool_name, MachinePool, NewPool, PoolBinding, PoolBookkeeping,
    WorkloadKey,
};
use crate::demand::GroupDemand;
use crate::index::{PoolIndex, PoolLookup};
use crate::Error;

/// Planner inputs that come from configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannerSettings {
    /// Pool sharing strategy for new plans
    pub strategy: MachineSetsStrategy,
    /// Ceiling on replicas across controller-managed pools
    pub ceiling: u32,
    /// Shared pool shrink policy for releases
    pub shrink: SharedPoolShrink,
}

impl From<&InstaScaleConfig> for PlannerSettings {
    fn from(config: &InstaScaleConfig) -> Self {
        Self {
            strategy: config.machine_sets_strategy,
            ceiling: config.max_scaleout_allowed,
            shrink: config.shared_pool_shrink,
        }
    }
}

/// What to do with one pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolAction {
    /// Create a new MachineSet
    Create(NewPool),
    /// Patch `spec.replicas` guarded by `resource_version`
    Scale {
        /// MachineSet name
        name: String,
        /// Desired replicas observed when planning
        from: u32,
        /// Desired replicas after the patch
        to: u32,
        /// Precondition for the patch
        resource_version: Option<String>,
    },
    /// The pool already satisfies the plan; no API call
    Keep {
        /// MachineSet name
        name: String,
    },
}

impl PoolAction {
    /// True if applying this action issues no API call
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep { .. })
    }
}

/// Plan for one pod group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanEntry {
    /// Pod group index
    pub group_index: usize,
    /// Instance type the group asked for
    pub instance_type: String,
    /// Pool bound to the group
    pub pool: String,
    /// Action on the pool; groups folded onto an earlier entry's pool get `Keep`
    pub action: PoolAction,
    /// Replicas the group asked for
    pub demand: u32,
    /// Replicas this entry adds to the cluster
    pub newly_requested: u32,
}

/// What releasing a workload's bindings does to one pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeardownAction {
    /// Delete a dedicated pool
    Delete {
        /// MachineSet name
        pool: String,
    },
    /// Shrink a shared pool
    ScaleDown {
        /// MachineSet name
        pool: String,
        /// Desired replicas observed when planning
        from: u32,
        /// Desired replicas after the patch
        to: u32,
        /// Precondition for the patch
        resource_version: Option<String>,
    },
    /// Leave the pool at its current size
    Retain {
        /// MachineSet name
        pool: String,
        /// Current desired replicas
        replicas: u32,
    },
    /// The pool no longer exists or is not ours to touch
    Skip {
        /// MachineSet name
        pool: String,
    },
}

impl TeardownAction {
    /// Pool the action applies to
    pub fn pool(&self) -> &str {
        match self {
            Self::Delete { pool }
            | Self::ScaleDown { pool, .. }
            | Self::Retain { pool, .. }
            | Self::Skip { pool } => pool,
        }
    }

    /// Desired replicas of the pool once the action is applied
    pub fn resulting_replicas(&self) -> u32 {
        match self {
            Self::Delete { .. } | Self::Skip { .. } => 0,
            Self::ScaleDown { to, .. } => *to,
            Self::Retain { replicas, .. } => *replicas,
        }
    }
}

/// Result of a planning pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalePlan {
    /// Strategy the plan was made under
    pub strategy: MachineSetsStrategy,
    /// One entry per pod group, in demand order
    pub entries: Vec<PlanEntry>,
    /// Stale bindings from previous bookkeeping
    pub releases: Vec<(usize, PoolBinding)>,
    /// What releasing the stale bindings does to their pools
    pub release_actions: Vec<TeardownAction>,
    /// Replicas the plan adds to the cluster
    pub newly_requested: u32,
    /// Replicas across controller-managed pools once the plan is applied
    pub projected_total: u32,
}

impl ScalePlan {
    /// Bookkeeping to persist once the plan is applied
    pub fn bookkeeping(&self) -> PoolBookkeeping {
        let mut bookkeeping = PoolBookkeeping::new(self.strategy);
        for entry in &self.entries {
            bookkeeping.entries.insert(
                entry.group_index,
                PoolBinding {
                    pool: entry.pool.clone(),
                    instance_type: entry.instance_type.clone(),
                    replicas: entry.demand,
                },
            );
        }
        bookkeeping
    }

    /// True if applying the plan issues no API call
    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|e| e.action.is_keep())
            && self
                .release_actions
                .iter()
                .all(|a| matches!(a, TeardownAction::Retain { .. } | TeardownAction::Skip { .. }))
    }
}

/// Running per-pool state while folding groups
struct PoolTarget {
    first_entry: usize,
    observed: Option<(u32, Option<String>)>,
    instance_type: String,
    owner: Option<WorkloadKey>,
    target: u32,
}

/// Plan a scale-out for `demand`
///
/// `existing` is the workload's own bookkeeping from a previous pass. Fails
/// with [`Error::ScaleoutCeilingExceeded`] if the plan requests new replicas
/// and the projected total over managed pools would pass the ceiling; the
/// check is all-or-nothing. Fails with [`Error::PoolNameTaken`] if the pool a
/// group needs is held by a MachineSet serving another instance type or owned
/// by another workload.
pub fn plan(
    key: &WorkloadKey,
    demand: &[GroupDemand],
    index: &PoolIndex,
    settings: &PlannerSettings,
    existing: Option<&PoolBookkeeping>,
) -> Result<ScalePlan, Error> {
    let mut entries = Vec::with_capacity(demand.len());
    let mut targets: BTreeMap<String, PoolTarget> = BTreeMap::new();

    for group in demand {
        let (name, owner) = match settings.strategy {
            MachineSetsStrategy::Reuse => {
                let prior = existing
                    .filter(|b| b.strategy == MachineSetsStrategy::Reuse)
                    .and_then(|b| b.entries.get(&group.index))
                    .filter(|b| b.instance_type == group.instance_type)
                    .map(|b| b.pool.as_str());
                let name = select_shared_pool(index, &group.instance_type, prior)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| shared_pool_name(&group.instance_type));
                (name, None)
            }
            MachineSetsStrategy::Dedicated => (
                dedicated_pool_name(key, group.index, &group.instance_type),
                Some(key.clone()),
            ),
        };
        if let Some(taken) = index.pool(&name) {
            check_claim(key, taken, &group.instance_type, owner.as_ref())?;
        }

        match targets.get_mut(&name) {
            Some(existing_target) => {
                existing_target.target = existing_target.target.max(group.replicas);
            }
            None => {
                let observed = index
                    .pool(&name)
                    .map(|p| (p.replicas, p.resource_version.clone()));
                let target = match settings.strategy {
                    MachineSetsStrategy::Reuse => {
                        let current = observed.as_ref().map(|(r, _)| *r).unwrap_or(0);
                        let peers = index.live_peer_max(&name).unwrap_or(0);
                        current.max(peers).max(group.replicas)
                    }
                    MachineSetsStrategy::Dedicated => group.replicas,
                };
                targets.insert(
                    name.clone(),
                    PoolTarget {
                        first_entry: entries.len(),
                        observed,
                        instance_type: group.instance_type.clone(),
                        owner,
                        target,
                    },
                );
            }
        }

        entries.push(PlanEntry {
            group_index: group.index,
            instance_type: group.instance_type.clone(),
            pool: name.clone(),
            action: PoolAction::Keep { name },
            demand: group.replicas,
            newly_requested: 0,
        });
    }

    let mut newly_requested: u32 = 0;
    for (name, target) in &targets {
        let (action, added) = match &target.observed {
            None => (
                PoolAction::Create(NewPool {
                    name: name.clone(),
                    instance_type: target.instance_type.clone(),
                    replicas: target.target,
                    owner: target.owner.clone(),
                }),
                target.target,
            ),
            Some((current, _)) if *current == target.target => {
                (PoolAction::Keep { name: name.clone() }, 0)
            }
            Some((current, resource_version)) => (
                PoolAction::Scale {
                    name: name.clone(),
                    from: *current,
                    to: target.target,
                    resource_version: resource_version.clone(),
                },
                target.target.saturating_sub(*current),
            ),
        };
        let entry = &mut entries[target.first_entry];
        entry.action = action;
        entry.newly_requested = added;
        newly_requested = newly_requested.saturating_add(added);
    }

    let (releases, release_strategy) = match existing {
        Some(bookkeeping) => (
            bookkeeping
                .entries
                .iter()
                .filter(|(_, binding)| !targets.contains_key(&binding.pool))
                .map(|(idx, binding)| (*idx, binding.clone()))
                .collect::<Vec<_>>(),
            bookkeeping.strategy,
        ),
        None => (Vec::new(), settings.strategy),
    };
    let release_actions = plan_teardown(
        key,
        releases.iter().map(|(_, b)| b),
        release_strategy,
        index,
        settings.shrink,
    );

    let mut projected: BTreeMap<&str, u32> = targets
        .iter()
        .map(|(name, t)| (name.as_str(), t.target))
        .collect();
    for action in &release_actions {
        projected
            .entry(action.pool())
            .or_insert_with(|| action.resulting_replicas());
    }
    for pool in index.referenced_pools() {
        projected
            .entry(pool)
            .or_insert_with(|| index.pool(pool).map(|p| p.replicas).unwrap_or(0));
    }
    let projected_total = projected
        .values()
        .fold(0, |total: u32, replicas| total.saturating_add(*replicas));

    if newly_requested > 0 && projected_total > settings.ceiling {
        return Err(Error::ScaleoutCeilingExceeded {
            workload: key.to_string(),
            requested: newly_requested,
            projected: projected_total,
            ceiling: settings.ceiling,
        });
    }

    Ok(ScalePlan {
        strategy: settings.strategy,
        entries,
        releases,
        release_actions,
        newly_requested,
        projected_total,
    })
}

/// Reject an existing pool that a group would bind to by name only
fn check_claim(
    key: &WorkloadKey,
    pool: &MachinePool,
    instance_type: &str,
    owner: Option<&WorkloadKey>,
) -> Result<(), Error> {
    let taken = |message: String| Error::PoolNameTaken {
        workload: key.to_string(),
        pool: pool.name.clone(),
        message,
    };
    if !pool.serves(instance_type) {
        return Err(taken(format!(
            "serves {}, not {instance_type}",
            pool.instance_type.as_deref().unwrap_or("an unknown instance type")
        )));
    }
    if pool.owner.as_ref() != owner {
        return Err(taken(match &pool.owner {
            Some(other) => format!("dedicated to {other}"),
            None => "shared by other workloads".to_string(),
        }));
    }
    Ok(())
}

/// Pick the shared pool a group should reuse
///
/// Prefers the pool the group was already bound to, then pools other
/// workloads reference, then name order. Dedicated pools are never reused.
fn select_shared_pool<'a>(
    index: &'a PoolIndex,
    instance_type: &str,
    prior: Option<&str>,
) -> Option<&'a MachinePool> {
    let PoolLookup::Found(found) = index.lookup(instance_type) else {
        return None;
    };
    let referenced = index.referenced_pools();
    let mut candidates: Vec<&MachinePool> =
        found.into_iter().filter(|p| !p.is_dedicated()).collect();
    candidates.sort_by_key(|p| {
        (
            Some(p.name.as_str()) != prior,
            !referenced.contains(p.name.as_str()),
            p.name.clone(),
        )
    });
    candidates.into_iter().next()
}

/// True if persisted bookkeeping already reflects `demand` under `strategy`
pub fn demand_matches(
    bookkeeping: &PoolBookkeeping,
    demand: &[GroupDemand],
    strategy: MachineSetsStrategy,
) -> bool {
    bookkeeping.strategy == strategy
        && bookkeeping.entries.len() == demand.len()
        && demand.iter().all(|group| {
            bookkeeping.entries.get(&group.index).is_some_and(|b| {
                b.instance_type == group.instance_type && b.replicas == group.replicas
            })
        })
}

/// Decide what releasing one workload's demand on `pool` does
///
/// `own_demand` is the highest replica count the departing workload bound to
/// the pool and `live_peer_max` the highest among workloads that still hold
/// it.
pub fn plan_release(
    key: &WorkloadKey,
    name: &str,
    own_demand: u32,
    strategy: MachineSetsStrategy,
    pool: Option<&MachinePool>,
    live_peer_max: Option<u32>,
    shrink: SharedPoolShrink,
) -> TeardownAction {
    let Some(pool) = pool else {
        return TeardownAction::Skip {
            pool: name.to_string(),
        };
    };
    let retain = TeardownAction::Retain {
        pool: name.to_string(),
        replicas: pool.replicas,
    };
    let scale_to = |to: u32| TeardownAction::ScaleDown {
        pool: name.to_string(),
        from: pool.replicas,
        to,
        resource_version: pool.resource_version.clone(),
    };

    match strategy {
        MachineSetsStrategy::Dedicated if pool.owner.as_ref() == Some(key) => {
            TeardownAction::Delete {
                pool: name.to_string(),
            }
        }
        MachineSetsStrategy::Dedicated => TeardownAction::Skip {
            pool: name.to_string(),
        },
        MachineSetsStrategy::Reuse => match live_peer_max {
            None if pool.replicas == 0 => retain,
            None => scale_to(0),
            Some(peer_max)
                if shrink == SharedPoolShrink::Recompute
                    && own_demand >= pool.replicas
                    && peer_max < pool.replicas =>
            {
                scale_to(peer_max)
            }
            Some(_) => retain,
        },
    }
}

/// Teardown actions for a set of bindings, one per distinct pool in name order
pub fn plan_teardown<'a>(
    key: &WorkloadKey,
    bindings: impl IntoIterator<Item = &'a PoolBinding>,
    strategy: MachineSetsStrategy,
    index: &PoolIndex,
    shrink: SharedPoolShrink,
) -> Vec<TeardownAction> {
    let mut own_demand: BTreeMap<&str, u32> = BTreeMap::new();
    for binding in bindings {
        let demand = own_demand.entry(binding.pool.as_str()).or_insert(0);
        *demand = (*demand).max(binding.replicas);
    }
    own_demand
        .into_iter()
        .map(|(name, demand)| {
            plan_release(
                key,
                name,
                demand,
                strategy,
                index.pool(name),
                index.live_peer_max(name),
                shrink,
            )
        })
        .collect()
}
