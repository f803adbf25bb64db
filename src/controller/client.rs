//! API clients used by the AppWrapper controller
//!
//! Both traits are mocked in unit tests; the `Kube*` implementations talk to
//! the API server and bound every call with the configured timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    machineset_api_resource, pool_from_template, select_template, AppWrapper, MachinePool,
    NewPool, WorkloadKey,
};
use crate::retry::with_timeout;
use crate::{Error, FIELD_MANAGER, FINALIZER};

/// Trait abstracting MachineSet operations
///
/// This trait allows mocking the machine API in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachinePoolClient: Send + Sync {
    /// List every MachineSet in the managed namespace
    async fn list_pools(&self) -> Result<Vec<MachinePool>, Error>;

    /// Create a MachineSet, cloning provider configuration from an existing one
    async fn create_pool(&self, pool: &NewPool) -> Result<(), Error>;

    /// Patch `spec.replicas`
    ///
    /// When `resource_version` is set the patch fails with
    /// [`Error::Conflict`] if the MachineSet changed since it was read.
    async fn scale_pool(
        &self,
        name: &str,
        replicas: u32,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Delete a MachineSet; a pool that is already gone is not an error
    async fn delete_pool(&self, name: &str) -> Result<(), Error>;
}

/// Trait abstracting the AppWrapper writes InstaScale performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// List AppWrappers in all namespaces
    async fn list_workloads(&self) -> Result<Vec<AppWrapper>, Error>;

    /// Merge annotations; `None` values remove the annotation
    async fn patch_annotations(
        &self,
        key: &WorkloadKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), Error>;

    /// Add the InstaScale finalizer if missing
    async fn add_finalizer(&self, key: &WorkloadKey) -> Result<(), Error>;

    /// Remove the InstaScale finalizer if present
    async fn remove_finalizer(&self, key: &WorkloadKey) -> Result<(), Error>;
}

/// MachineSet client backed by the API server
pub struct KubeMachinePoolClient {
    client: Client,
    namespace: String,
    timeout: Duration,
}

impl KubeMachinePoolClient {
    /// Create a client for MachineSets in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            timeout,
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &self.namespace,
            &machineset_api_resource(),
        )
    }
}

#[async_trait]
impl MachinePoolClient for KubeMachinePoolClient {
    async fn list_pools(&self) -> Result<Vec<MachinePool>, Error> {
        let context = "list MachineSets";
        with_timeout(self.timeout, context, async {
            let list = self
                .api()
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::from_kube(context, e))?;
            Ok::<_, Error>(list.items.iter().map(MachinePool::from_dynamic).collect())
        })
        .await
    }

    async fn create_pool(&self, pool: &NewPool) -> Result<(), Error> {
        let context = format!("create MachineSet {}", pool.name);
        with_timeout(self.timeout, &context, async {
            let api = self.api();
            let existing = api
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::from_kube(&context, e))?;
            let template = select_template(&existing.items, &pool.instance_type).ok_or_else(
                || Error::MissingTemplate {
                    instance_type: pool.instance_type.clone(),
                    namespace: self.namespace.clone(),
                },
            )?;
            let obj = pool_from_template(template, pool, &self.namespace)?;

            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            api.create(&params, &obj)
                .await
                .map_err(|e| Error::from_kube(&context, e))?;
            info!(
                pool = %pool.name,
                instance_type = %pool.instance_type,
                replicas = pool.replicas,
                "Created MachineSet"
            );
            Ok::<_, Error>(())
        })
        .await
    }

    async fn scale_pool(
        &self,
        name: &str,
        replicas: u32,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let context = format!("scale MachineSet {name}");
        with_timeout(self.timeout, &context, async {
            let mut patch = serde_json::json!({
                "spec": { "replicas": replicas }
            });
            if let Some(rv) = resource_version {
                patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
            }
            self.api()
                .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
                .map_err(|e| Error::from_kube(&context, e))?;
            info!(pool = %name, replicas, "Scaled MachineSet");
            Ok::<_, Error>(())
        })
        .await
    }

    async fn delete_pool(&self, name: &str) -> Result<(), Error> {
        let context = format!("delete MachineSet {name}");
        with_timeout(self.timeout, &context, async {
            match self.api().delete(name, &DeleteParams::default()).await {
                Ok(_) => {
                    info!(pool = %name, "Deleted MachineSet");
                    Ok(())
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(pool = %name, "MachineSet not found (already deleted)");
                    Ok(())
                }
                Err(e) => Err(Error::from_kube(&context, e)),
            }
        })
        .await
    }
}

/// AppWrapper client backed by the API server
pub struct KubeWorkloadClient {
    client: Client,
    timeout: Duration,
}

impl KubeWorkloadClient {
    /// Create a new client
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, namespace: &str) -> Api<AppWrapper> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Read-modify-write the finalizer list with a resourceVersion precondition
    async fn update_finalizers(
        &self,
        key: &WorkloadKey,
        context: &str,
        update: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<(), Error> {
        with_timeout(self.timeout, context, async {
            let api = self.api(&key.namespace);
            let aw = match api.get(&key.name).await {
                Ok(aw) => aw,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(workload = %key, "AppWrapper not found (already deleted)");
                    return Ok(());
                }
                Err(e) => return Err(Error::from_kube(context, e)),
            };

            let mut finalizers = aw.metadata.finalizers.clone().unwrap_or_default();
            if !update(&mut finalizers) {
                return Ok(());
            }

            let patch = serde_json::json!({
                "metadata": {
                    "finalizers": finalizers,
                    "resourceVersion": aw.metadata.resource_version,
                }
            });
            api.patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
                .map_err(|e| Error::from_kube(context, e))?;
            Ok::<_, Error>(())
        })
        .await
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn list_workloads(&self) -> Result<Vec<AppWrapper>, Error> {
        let context = "list AppWrappers";
        with_timeout(self.timeout, context, async {
            let api: Api<AppWrapper> = Api::all(self.client.clone());
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::from_kube(context, e))?;
            Ok::<_, Error>(list.items)
        })
        .await
    }

    async fn patch_annotations(
        &self,
        key: &WorkloadKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let context = format!("annotate AppWrapper {key}");
        with_timeout(self.timeout, &context, async {
            let patch = serde_json::json!({
                "metadata": { "annotations": annotations }
            });
            self.api(&key.namespace)
                .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
                .map_err(|e| Error::from_kube(&context, e))?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn add_finalizer(&self, key: &WorkloadKey) -> Result<(), Error> {
        let context = format!("add finalizer to AppWrapper {key}");
        self.update_finalizers(key, &context, |finalizers| {
            if finalizers.iter().any(|f| f == FINALIZER) {
                return false;
            }
            finalizers.push(FINALIZER.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(&self, key: &WorkloadKey) -> Result<(), Error> {
        let context = format!("remove finalizer from AppWrapper {key}");
        self.update_finalizers(key, &context, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != FINALIZER);
            finalizers.len() != before
        })
        .await
    }
}
