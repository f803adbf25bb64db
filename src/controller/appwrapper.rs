//! AppWrapper controller implementation
//!
//! Each pass observes the AppWrapper, derives its [`ReconcilePhase`], and
//! either plans and applies a scale-out, tears capacity down, or does nothing.
//! Bookkeeping is read fresh from the object every pass, so a restarted
//! controller picks up exactly where the last one stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::client::{KubeMachinePoolClient, KubeWorkloadClient, MachinePoolClient, WorkloadClient};
use super::teardown::{apply_teardown, release_all};
use crate::config::{InstaScaleConfig, MachineSetsStrategy};
use crate::crd::{
    AppWrapper, Condition, ConditionStatus, MachinePool, PoolBookkeeping, WorkloadKey,
};
use crate::demand::{extract_demand, total_replicas, GroupDemand};
use crate::error::RequeueClass;
use crate::events::{
    actions, reasons, workload_ref, EventPublisher, KubeEventPublisher, CONTROLLER_NAME,
};
use crate::index::PoolIndex;
use crate::planner::{self, demand_matches, PlannerSettings, PoolAction, ScalePlan};
use crate::retry::{exponential_delay, retry_with_backoff, FailureTracker, RetryConfig};
use crate::{Error, CONDITION_ANNOTATION, POOLS_ANNOTATION, SCALED_OUT_CONDITION};

/// Planning passes per reconcile before a conflict is handed to the error policy
pub const MAX_REPLANS: u32 = 3;

/// Requeue delay once in-pass re-plans are exhausted
pub const REPLAN_DELAY: Duration = Duration::from_secs(1);

/// Attempts at persisting bookkeeping after pools were mutated
const PERSIST_ATTEMPTS: u32 = 5;

/// Where a workload is in its scale-out lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilePhase {
    /// Never planned: no bookkeeping, no finalizer
    Unseen,
    /// Bookkeeping out of date with the demand
    Planning,
    /// Finalizer set but nothing persisted yet: a previous pass stopped mid-apply
    Applying,
    /// Bookkeeping matches the demand
    Settled,
    /// Deleting or finished with capacity still bound
    TearingDown,
    /// Nothing left to do for this workload
    Removed,
}

impl ReconcilePhase {
    /// Derive the phase from the object and its extracted demand
    ///
    /// `demand` is `None` when the instance preference is malformed.
    pub fn observe(
        aw: &AppWrapper,
        bookkeeping: Option<&PoolBookkeeping>,
        demand: Option<&[GroupDemand]>,
        strategy: MachineSetsStrategy,
    ) -> Self {
        if aw.is_deleting() {
            return if aw.has_finalizer() {
                Self::TearingDown
            } else {
                Self::Removed
            };
        }
        if aw.is_terminal() {
            return if bookkeeping.is_some() || aw.has_finalizer() {
                Self::TearingDown
            } else {
                Self::Removed
            };
        }
        match (bookkeeping, demand) {
            (Some(b), Some(d)) if demand_matches(b, d, strategy) => Self::Settled,
            (None, _) if aw.has_finalizer() => Self::Applying,
            (None, _) => Self::Unseen,
            _ => Self::Planning,
        }
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, config).build();
/// ```
pub struct Context {
    /// MachineSet operations (trait object for testability)
    pub machine_pools: Arc<dyn MachinePoolClient>,
    /// AppWrapper operations (trait object for testability)
    pub workloads: Arc<dyn WorkloadClient>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Immutable controller configuration
    pub config: InstaScaleConfig,
    /// Consecutive transient failures per workload
    pub failures: FailureTracker<WorkloadKey>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: InstaScaleConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context for testing with custom clients
    ///
    /// Events are discarded. For production code, use [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        machine_pools: Arc<dyn MachinePoolClient>,
        workloads: Arc<dyn WorkloadClient>,
        config: InstaScaleConfig,
    ) -> Self {
        Self {
            machine_pools,
            workloads,
            events: Arc::new(crate::events::NoopEventPublisher),
            config,
            failures: FailureTracker::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: InstaScaleConfig,
    machine_pools: Option<Arc<dyn MachinePoolClient>>,
    workloads: Option<Arc<dyn WorkloadClient>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, config: InstaScaleConfig) -> Self {
        Self {
            client,
            config,
            machine_pools: None,
            workloads: None,
            events: None,
        }
    }

    /// Override the MachineSet client (primarily for testing)
    pub fn machine_pool_client(mut self, client: Arc<dyn MachinePoolClient>) -> Self {
        self.machine_pools = Some(client);
        self
    }

    /// Override the AppWrapper client (primarily for testing)
    pub fn workload_client(mut self, client: Arc<dyn WorkloadClient>) -> Self {
        self.workloads = Some(client);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let timeout = self.config.api_timeout();
        Context {
            machine_pools: self.machine_pools.unwrap_or_else(|| {
                Arc::new(KubeMachinePoolClient::new(
                    self.client.clone(),
                    self.config.machine_set_namespace.clone(),
                    timeout,
                ))
            }),
            workloads: self
                .workloads
                .unwrap_or_else(|| Arc::new(KubeWorkloadClient::new(self.client.clone(), timeout))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config: self.config,
            failures: FailureTracker::default(),
        }
    }
}

/// Reconcile an AppWrapper
///
/// Plans and applies a scale-out when the demand is new or changed, tears
/// capacity down on completion or deletion, and otherwise waits for the next
/// change.
#[instrument(
    skip(aw, ctx),
    fields(workload = %aw.name_any(), namespace = %aw.namespace().unwrap_or_default())
)]
pub async fn reconcile(aw: Arc<AppWrapper>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = aw.workload_key()?;
    let bookkeeping = match aw.bookkeeping() {
        Ok(bookkeeping) => bookkeeping,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable pool bookkeeping");
            None
        }
    };
    let demand = extract_demand(&aw);
    let strategy = ctx.config.machine_sets_strategy;
    let phase = ReconcilePhase::observe(
        &aw,
        bookkeeping.as_ref(),
        demand.as_deref().ok(),
        strategy,
    );
    debug!(?phase, "observed workload");

    match phase {
        ReconcilePhase::Removed => Ok(Action::await_change()),
        ReconcilePhase::TearingDown => teardown(&aw, &key, bookkeeping.as_ref(), &ctx).await,
        ReconcilePhase::Settled => {
            ctx.failures.reset(&key);
            Ok(Action::await_change())
        }
        ReconcilePhase::Unseen | ReconcilePhase::Planning | ReconcilePhase::Applying => {
            plan_or_report(&aw, &key, demand, bookkeeping.as_ref(), &ctx).await
        }
    }
}

/// Scale out for a parseable demand, record the condition for a malformed one
async fn plan_or_report(
    aw: &AppWrapper,
    key: &WorkloadKey,
    demand: Result<Vec<GroupDemand>, Error>,
    bookkeeping: Option<&PoolBookkeeping>,
    ctx: &Context,
) -> Result<Action, Error> {
    match demand {
        Ok(demand) => scale_out(aw, key, &demand, bookkeeping, ctx).await,
        Err(e @ Error::MalformedPreference { .. }) => {
            warn!(error = %e, "Instance preference does not match pod groups");
            record_condition(
                aw,
                key,
                ctx,
                Condition::new(
                    SCALED_OUT_CONDITION,
                    ConditionStatus::False,
                    reasons::MALFORMED_PREFERENCE,
                    e.to_string(),
                ),
                actions::PLAN,
            )
            .await?;
            // Terminal until the label or pod groups change
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Error policy for the controller
///
/// Transient failures back off exponentially per workload, ceiling rejections
/// wait the fixed ceiling backoff, conflicts re-plan right away and terminal
/// errors wait for the object to change.
pub fn error_policy(aw: Arc<AppWrapper>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = aw.name_any();
    match error.requeue_class() {
        RequeueClass::Transient => {
            let failures = aw
                .workload_key()
                .map(|key| ctx.failures.record_failure(key))
                .unwrap_or(1);
            let (initial, max) = ctx.config.transient_backoff_bounds();
            let delay = exponential_delay(initial, max, failures);
            warn!(
                workload = %name,
                failures,
                delay_secs = delay.as_secs_f64(),
                error = %error,
                "Reconciliation failed, backing off"
            );
            Action::requeue(delay)
        }
        RequeueClass::Ceiling => {
            warn!(workload = %name, error = %error, "Capacity unavailable, retrying later");
            Action::requeue(ctx.config.ceiling_backoff())
        }
        RequeueClass::Replan => {
            debug!(workload = %name, error = %error, "Re-planning after concurrent update");
            Action::requeue(REPLAN_DELAY)
        }
        RequeueClass::Terminal => {
            error!(workload = %name, error = %error, "Reconciliation failed permanently");
            Action::await_change()
        }
    }
}

/// Snapshot pools and peer references
pub(crate) async fn build_index(ctx: &Context, key: &WorkloadKey) -> Result<PoolIndex, Error> {
    let pools = ctx.machine_pools.list_pools().await?;
    let workloads = ctx.workloads.list_workloads().await?;
    Ok(PoolIndex::build(pools, &workloads, key))
}

async fn scale_out(
    aw: &AppWrapper,
    key: &WorkloadKey,
    demand: &[GroupDemand],
    bookkeeping: Option<&PoolBookkeeping>,
    ctx: &Context,
) -> Result<Action, Error> {
    info!(
        groups = demand.len(),
        replicas = total_replicas(demand),
        "Planning scale-out"
    );
    for group in demand {
        debug!(
            group = group.index,
            instance_type = %group.instance_type,
            replicas = group.replicas,
            envelope = %group.envelope,
            "pod group demand"
        );
    }

    if !aw.has_finalizer() {
        ctx.workloads.add_finalizer(key).await?;
    }

    let plan = match plan_and_apply(aw, key, demand, bookkeeping, ctx).await {
        Ok(plan) => plan,
        Err(e) => {
            let reason = match e {
                Error::ScaleoutCeilingExceeded { .. } => reasons::SCALEOUT_CEILING_EXCEEDED,
                Error::PoolNameTaken { .. } => reasons::POOL_NAME_TAKEN,
                _ => return Err(e),
            };
            warn!(error = %e, "Scale-out rejected");
            record_condition(
                aw,
                key,
                ctx,
                Condition::new(
                    SCALED_OUT_CONDITION,
                    ConditionStatus::False,
                    reason,
                    e.to_string(),
                ),
                actions::SCALE_OUT,
            )
            .await?;
            return Ok(Action::requeue(ctx.config.ceiling_backoff()));
        }
    };

    persist(aw, key, &plan, ctx).await?;
    ctx.failures.reset(key);
    Ok(Action::await_change())
}

/// Plan from a fresh snapshot and apply, re-planning on conflicts
async fn plan_and_apply(
    aw: &AppWrapper,
    key: &WorkloadKey,
    demand: &[GroupDemand],
    bookkeeping: Option<&PoolBookkeeping>,
    ctx: &Context,
) -> Result<ScalePlan, Error> {
    let settings = PlannerSettings::from(&ctx.config);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let index = build_index(ctx, key).await?;
        let plan = planner::plan(key, demand, &index, &settings, bookkeeping)?;
        debug!(
            attempt,
            newly_requested = plan.newly_requested,
            projected_total = plan.projected_total,
            ceiling = settings.ceiling,
            noop = plan.is_noop(),
            "Plan computed"
        );

        match apply_plan(aw, &plan, &index, ctx).await {
            Ok(()) => return Ok(plan),
            Err(e) if e.requeue_class() == RequeueClass::Replan && attempt < MAX_REPLANS => {
                warn!(attempt, error = %e, "Pool changed while applying, re-planning");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn apply_plan(
    aw: &AppWrapper,
    plan: &ScalePlan,
    index: &PoolIndex,
    ctx: &Context,
) -> Result<(), Error> {
    for entry in &plan.entries {
        match &entry.action {
            PoolAction::Create(pool) => {
                info!(
                    group = entry.group_index,
                    pool = %pool.name,
                    replicas = pool.replicas,
                    "Creating MachineSet"
                );
                ctx.machine_pools.create_pool(pool).await?;
            }
            PoolAction::Scale {
                name,
                from,
                to,
                resource_version,
            } => {
                info!(
                    group = entry.group_index,
                    pool = %name,
                    from,
                    to,
                    "Scaling MachineSet"
                );
                ctx.machine_pools
                    .scale_pool(name, *to, resource_version.clone())
                    .await?;
            }
            PoolAction::Keep { name } => {
                let pool = index.pool(name);
                debug!(
                    group = entry.group_index,
                    pool = %name,
                    ready = pool.map(|p| p.ready_replicas),
                    settled = pool.is_some_and(MachinePool::is_settled),
                    "MachineSet already sized"
                );
            }
        }
    }
    apply_teardown(ctx, aw, &plan.release_actions).await
}

/// Persist bookkeeping and the ScaledOut condition
///
/// Pools are already mutated at this point, so only the annotation write is
/// retried.
async fn persist(
    aw: &AppWrapper,
    key: &WorkloadKey,
    plan: &ScalePlan,
    ctx: &Context,
) -> Result<(), Error> {
    let pools = plan.bookkeeping().pools().len();
    let message = format!(
        "{} replica(s) across {} MachineSet(s)",
        plan.entries.iter().map(|e| e.demand).sum::<u32>(),
        pools
    );
    let condition = Condition::new(
        SCALED_OUT_CONDITION,
        ConditionStatus::True,
        reasons::SCALED_OUT,
        message.clone(),
    );
    let annotations = BTreeMap::from([
        (
            POOLS_ANNOTATION.to_string(),
            Some(plan.bookkeeping().encode()?),
        ),
        (
            CONDITION_ANNOTATION.to_string(),
            Some(serde_json::to_string(&condition)?),
        ),
    ]);

    retry_with_backoff(
        &RetryConfig::with_max_attempts(PERSIST_ATTEMPTS),
        "persist pool bookkeeping",
        |e: &Error| e.is_retryable(),
        move || ctx.workloads.patch_annotations(key, annotations.clone()),
    )
    .await?;

    info!(%message, "Scale-out settled");
    ctx.events
        .publish(
            &workload_ref(aw),
            EventType::Normal,
            reasons::SCALED_OUT,
            actions::SCALE_OUT,
            Some(message),
        )
        .await;
    Ok(())
}

async fn teardown(
    aw: &AppWrapper,
    key: &WorkloadKey,
    bookkeeping: Option<&PoolBookkeeping>,
    ctx: &Context,
) -> Result<Action, Error> {
    info!(deleting = aw.is_deleting(), state = ?aw.state(), "Tearing down capacity");
    if let Some(bookkeeping) = bookkeeping {
        release_all(ctx, aw, key, bookkeeping).await?;
    }

    if !aw.is_deleting() {
        ctx.workloads
            .patch_annotations(key, BTreeMap::from([(POOLS_ANNOTATION.to_string(), None)]))
            .await?;
    }
    if aw.has_finalizer() {
        ctx.workloads.remove_finalizer(key).await?;
    }

    ctx.failures.reset(key);
    info!("Teardown complete");
    Ok(Action::await_change())
}

/// Record a condition unless the same one is already recorded
async fn record_condition(
    aw: &AppWrapper,
    key: &WorkloadKey,
    ctx: &Context,
    condition: Condition,
    action: &str,
) -> Result<(), Error> {
    if let Some(current) = aw.instascale_condition() {
        if current.status == condition.status
            && current.reason == condition.reason
            && current.message == condition.message
        {
            return Ok(());
        }
    }

    let raw = serde_json::to_string(&condition)?;
    ctx.workloads
        .patch_annotations(key, BTreeMap::from([(CONDITION_ANNOTATION.to_string(), Some(raw))]))
        .await?;

    let type_ = match condition.status {
        ConditionStatus::True => EventType::Normal,
        _ => EventType::Warning,
    };
    ctx.events
        .publish(&workload_ref(aw), type_, &condition.reason, action, Some(condition.message))
        .await;
    Ok(())
}
