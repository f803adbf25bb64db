//! In-memory fakes for scenario tests
//!
//! The mocks in `controller` verify individual interactions; these fakes keep
//! state across passes so multi-workload scenarios can be replayed the way
//! the API server would see them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;
use kube::ResourceExt;

use crate::config::InstaScaleConfig;
use crate::controller::{Context, MachinePoolClient, WorkloadClient};
use crate::crd::{
    AppWrapper, AppWrapperGenericResource, AppWrapperResourceList, AppWrapperSpec,
    AppWrapperState, AppWrapperStatus, MachinePool, NewPool, WorkloadKey,
};
use crate::events::EventPublisher;
use crate::{Error, FINALIZER, ORDERED_INSTANCE_LABEL};

/// MachineSets held in memory with resourceVersion bookkeeping
#[derive(Default)]
pub struct FakeMachinePools {
    pools: Mutex<BTreeMap<String, MachinePool>>,
    mutations: AtomicUsize,
    version: AtomicUsize,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeMachinePools {
    /// Seed a pre-existing MachineSet
    pub fn seed(&self, name: &str, instance_type: &str, replicas: u32) {
        let version = self.next_version();
        self.pools.lock().unwrap().insert(
            name.to_string(),
            MachinePool {
                name: name.to_string(),
                namespace: "openshift-machine-api".to_string(),
                instance_type: Some(instance_type.to_string()),
                replicas,
                resource_version: Some(version),
                ..Default::default()
            },
        );
    }

    /// Desired replicas of a pool, `None` if it does not exist
    pub fn replicas(&self, name: &str) -> Option<u32> {
        self.pools.lock().unwrap().get(name).map(|p| p.replicas)
    }

    /// Names of every pool
    pub fn names(&self) -> Vec<String> {
        self.pools.lock().unwrap().keys().cloned().collect()
    }

    /// Create, scale and delete calls seen so far
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Change a pool behind the controller's back
    pub fn bump(&self, name: &str, replicas: u32) {
        let version = self.next_version();
        if let Some(pool) = self.pools.lock().unwrap().get_mut(name) {
            pool.replicas = replicas;
            pool.resource_version = Some(version);
        }
    }

    /// Make the next create or scale of `name` fail with a transient error
    pub fn fail_next_write(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Failed writes are not counted as mutations
    fn injected_failure(&self, name: &str) -> Result<(), Error> {
        if self.failing.lock().unwrap().remove(name) {
            return Err(Error::transient(format!("write {name}"), "connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl MachinePoolClient for FakeMachinePools {
    async fn list_pools(&self) -> Result<Vec<MachinePool>, Error> {
        Ok(self.pools.lock().unwrap().values().cloned().collect())
    }

    async fn create_pool(&self, pool: &NewPool) -> Result<(), Error> {
        self.injected_failure(&pool.name)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let version = self.next_version();
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(&pool.name) {
            return Err(Error::conflict(&pool.name, "already exists"));
        }
        pools.insert(
            pool.name.clone(),
            MachinePool {
                name: pool.name.clone(),
                namespace: "openshift-machine-api".to_string(),
                instance_type: Some(pool.instance_type.clone()),
                replicas: pool.replicas,
                resource_version: Some(version),
                owner: pool.owner.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn scale_pool(
        &self,
        name: &str,
        replicas: u32,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        self.injected_failure(name)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let version = self.next_version();
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: "MachineSet".to_string(),
            name: name.to_string(),
        })?;
        if resource_version.is_some() && resource_version != pool.resource_version {
            return Err(Error::conflict(name, "resourceVersion mismatch"));
        }
        pool.replicas = replicas;
        pool.resource_version = Some(version);
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<(), Error> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.pools.lock().unwrap().remove(name);
        Ok(())
    }
}

/// AppWrappers held in memory, honouring finalizers on deletion
#[derive(Default)]
pub struct FakeWorkloads {
    workloads: Mutex<BTreeMap<WorkloadKey, AppWrapper>>,
    patches: AtomicUsize,
    failing_patches: AtomicUsize,
}

impl FakeWorkloads {
    /// Store an AppWrapper
    pub fn insert(&self, aw: AppWrapper) {
        let key = aw.workload_key().unwrap();
        self.workloads.lock().unwrap().insert(key, aw);
    }

    /// Current copy of an AppWrapper
    pub fn get(&self, key: &WorkloadKey) -> Option<AppWrapper> {
        self.workloads.lock().unwrap().get(key).cloned()
    }

    /// Request deletion; the object goes away once its finalizers are gone
    pub fn delete(&self, key: &WorkloadKey) {
        let mut workloads = self.workloads.lock().unwrap();
        let Some(aw) = workloads.get_mut(key) else {
            return;
        };
        if aw.finalizers().is_empty() {
            workloads.remove(key);
        } else {
            aw.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    /// Set the dispatcher state
    pub fn set_state(&self, key: &WorkloadKey, state: AppWrapperState) {
        if let Some(aw) = self.workloads.lock().unwrap().get_mut(key) {
            aw.status = Some(AppWrapperStatus { state });
        }
    }

    /// Annotation and finalizer writes seen so far
    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    /// Make the next `count` annotation patches fail with a transient error
    pub fn fail_patches(&self, count: usize) {
        self.failing_patches.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkloadClient for FakeWorkloads {
    async fn list_workloads(&self) -> Result<Vec<AppWrapper>, Error> {
        Ok(self.workloads.lock().unwrap().values().cloned().collect())
    }

    async fn patch_annotations(
        &self,
        key: &WorkloadKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        if self
            .failing_patches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::transient("patch annotations", "connection reset"));
        }
        self.patches.fetch_add(1, Ordering::SeqCst);
        let mut workloads = self.workloads.lock().unwrap();
        let aw = workloads.get_mut(key).ok_or_else(|| Error::NotFound {
            kind: "AppWrapper".to_string(),
            name: key.to_string(),
        })?;
        let current = aw.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (name, value) in annotations {
            match value {
                Some(value) => current.insert(name, value),
                None => current.remove(&name),
            };
        }
        Ok(())
    }

    async fn add_finalizer(&self, key: &WorkloadKey) -> Result<(), Error> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        if let Some(aw) = self.workloads.lock().unwrap().get_mut(key) {
            let finalizers = aw.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == FINALIZER) {
                finalizers.push(FINALIZER.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &WorkloadKey) -> Result<(), Error> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        let mut workloads = self.workloads.lock().unwrap();
        let Some(aw) = workloads.get_mut(key) else {
            return Ok(());
        };
        if let Some(finalizers) = aw.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER);
        }
        if aw.is_deleting() && aw.finalizers().is_empty() {
            workloads.remove(key);
        }
        Ok(())
    }
}

/// Event publisher remembering reasons in order
#[derive(Default)]
pub struct RecordingEvents {
    reasons: Mutex<Vec<(EventType, String)>>,
}

impl RecordingEvents {
    /// Reasons published so far
    pub fn reasons(&self) -> Vec<String> {
        self.reasons
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    /// True if a Warning with `reason` was published
    pub fn warned(&self, reason: &str) -> bool {
        self.reasons
            .lock()
            .unwrap()
            .iter()
            .any(|(type_, r)| *type_ == EventType::Warning && r == reason)
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().unwrap().push((type_, reason.to_string()));
    }
}

/// Controller wired to in-memory fakes
pub struct Harness {
    pub ctx: Arc<Context>,
    pub pools: Arc<FakeMachinePools>,
    pub workloads: Arc<FakeWorkloads>,
    pub events: Arc<RecordingEvents>,
}

impl Harness {
    /// Harness with the given strategy and ceiling
    pub fn new(strategy: crate::config::MachineSetsStrategy, ceiling: u32) -> Self {
        let config = InstaScaleConfig {
            machine_sets_strategy: strategy,
            max_scaleout_allowed: ceiling,
            ..Default::default()
        };
        let pools = Arc::new(FakeMachinePools::default());
        let workloads = Arc::new(FakeWorkloads::default());
        let events = Arc::new(RecordingEvents::default());
        let mut ctx = Context::for_testing(pools.clone(), workloads.clone(), config);
        ctx.events = events.clone() as Arc<dyn EventPublisher>;
        Self {
            ctx: Arc::new(ctx),
            pools,
            workloads,
            events,
        }
    }

    /// Run one reconcile pass against the stored copy of `key`
    pub async fn reconcile(
        &self,
        key: &WorkloadKey,
    ) -> Result<kube::runtime::controller::Action, Error> {
        let aw = self
            .workloads
            .get(key)
            .ok_or_else(|| Error::validation(format!("{key} not stored")))?;
        crate::controller::reconcile(Arc::new(aw), self.ctx.clone()).await
    }
}

/// AppWrapper with one pod group per entry of `replicas`
pub fn appwrapper(name: &str, ordered_instance: &str, replicas: &[i32]) -> AppWrapper {
    AppWrapper {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            labels: Some(BTreeMap::from([(
                ORDERED_INSTANCE_LABEL.to_string(),
                ordered_instance.to_string(),
            )])),
            ..Default::default()
        },
        spec: AppWrapperSpec {
            resources: AppWrapperResourceList {
                generic_items: replicas
                    .iter()
                    .map(|r| AppWrapperGenericResource {
                        desired_available: *r,
                        custom_pod_resources: Vec::new(),
                    })
                    .collect(),
            },
        },
        status: Some(AppWrapperStatus {
            state: AppWrapperState::Running,
        }),
    }
}
