//! Teardown path
//!
//! Reverses a workload's scale-out using the bookkeeping it persisted: shared
//! pools are shrunk according to the remaining references, dedicated pools
//! are deleted. Also applies the release actions of a scale-out plan whose
//! demand moved away from previously bound pools.

use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use super::appwrapper::{build_index, Context, MAX_REPLANS};
use crate::crd::{AppWrapper, PoolBookkeeping, WorkloadKey};
use crate::error::RequeueClass;
use crate::events::{actions, reasons, workload_ref};
use crate::planner::{plan_teardown, TeardownAction};
use crate::Error;

/// Release every binding in `bookkeeping`
///
/// Each attempt re-reads pools and peer references; a conflict or a pool
/// vanishing mid-way triggers a fresh attempt, up to [`MAX_REPLANS`].
pub async fn release_all(
    ctx: &Context,
    aw: &AppWrapper,
    key: &WorkloadKey,
    bookkeeping: &PoolBookkeeping,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let index = build_index(ctx, key).await?;
        let teardown = plan_teardown(
            key,
            bookkeeping.entries.values(),
            bookkeeping.strategy,
            &index,
            ctx.config.shared_pool_shrink,
        );

        match apply_teardown(ctx, aw, &teardown).await {
            Ok(()) => {
                info!(pools = teardown.len(), "Released workload capacity");
                return Ok(());
            }
            Err(e) if e.requeue_class() == RequeueClass::Replan && attempt < MAX_REPLANS => {
                warn!(attempt, error = %e, "Teardown raced another writer, re-planning");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply teardown actions in order
pub async fn apply_teardown(
    ctx: &Context,
    aw: &AppWrapper,
    teardown: &[TeardownAction],
) -> Result<(), Error> {
    for action in teardown {
        match action {
            TeardownAction::Delete { pool } => {
                ctx.machine_pools.delete_pool(pool).await?;
                ctx.events
                    .publish(
                        &workload_ref(aw),
                        EventType::Normal,
                        reasons::POOL_DELETED,
                        actions::TEARDOWN,
                        Some(format!("Deleted dedicated MachineSet {pool}")),
                    )
                    .await;
            }
            TeardownAction::ScaleDown {
                pool,
                from,
                to,
                resource_version,
            } => {
                ctx.machine_pools
                    .scale_pool(pool, *to, resource_version.clone())
                    .await?;
                ctx.events
                    .publish(
                        &workload_ref(aw),
                        EventType::Normal,
                        reasons::SCALED_DOWN,
                        actions::TEARDOWN,
                        Some(format!("Scaled MachineSet {pool} from {from} to {to}")),
                    )
                    .await;
            }
            TeardownAction::Retain { pool, replicas } => {
                debug!(pool = %pool, replicas, "Leaving shared MachineSet in place");
            }
            TeardownAction::Skip { pool } => {
                debug!(pool = %pool, "MachineSet absent or not owned, skipping");
            }
        }
    }
    Ok(())
}
