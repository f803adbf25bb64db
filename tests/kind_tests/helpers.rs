//! Shared fixtures for the kind stories

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, DynamicObject, ObjectMeta, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use serde_json::json;

use instascale::crd::{
    machineset_api_resource, AppWrapper, AppWrapperGenericResource, AppWrapperResourceList,
    AppWrapperSpec,
};
use instascale::{FIELD_MANAGER, ORDERED_INSTANCE_LABEL};

/// Namespace the stories seed MachineSets into
pub const MACHINESET_NAMESPACE: &str = "default";

/// Connect to the cluster from the environment and make sure both CRDs exist
pub async fn ensure_test_cluster() -> Result<Client, kube::Error> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    crds.patch(
        "appwrappers.workload.codeflare.dev",
        &params,
        &Patch::Apply(AppWrapper::crd()),
    )
    .await?;
    crds.patch(
        "machinesets.machine.openshift.io",
        &params,
        &Patch::Apply(machineset_crd()),
    )
    .await?;

    // Give the API server a moment to serve the new kinds
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(client)
}

/// Minimal MachineSet CRD for clusters without the OpenShift machine API
fn machineset_crd() -> serde_json::Value {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": "machinesets.machine.openshift.io" },
        "spec": {
            "group": "machine.openshift.io",
            "scope": "Namespaced",
            "names": {
                "plural": "machinesets",
                "singular": "machineset",
                "kind": "MachineSet",
                "listKind": "MachineSetList"
            },
            "versions": [{
                "name": "v1beta1",
                "served": true,
                "storage": true,
                "schema": {
                    "openAPIV3Schema": {
                        "type": "object",
                        "x-kubernetes-preserve-unknown-fields": true
                    }
                }
            }]
        }
    })
}

/// A MachineSet with zero replicas running `instance_type`
pub fn sample_machineset(name: &str, instance_type: &str) -> DynamicObject {
    let resource = machineset_api_resource();
    let mut object = DynamicObject::new(name, &resource).within(MACHINESET_NAMESPACE);
    object.data = json!({
        "spec": {
            "replicas": 0,
            "selector": { "matchLabels": { "machine.openshift.io/cluster-api-machineset": name } },
            "template": {
                "metadata": { "labels": { "machine.openshift.io/cluster-api-machineset": name } },
                "spec": {
                    "providerSpec": { "value": { "instanceType": instance_type } }
                }
            }
        }
    });
    object
}

/// An AppWrapper asking for `replicas[i]` machines of each `orderedinstance` entry
pub fn sample_appwrapper(name: &str, ordered_instance: &str, replicas: &[i32]) -> AppWrapper {
    AppWrapper {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
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
        status: None,
    }
}

/// MachineSet API scoped to the story namespace
pub fn machinesets(client: &Client) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), MACHINESET_NAMESPACE, &machineset_api_resource())
}

/// Replica count of a MachineSet, `None` when it does not exist
pub async fn replicas_of(client: &Client, name: &str) -> Option<i64> {
    let object = machinesets(client).get_opt(name).await.ok()??;
    object.data.pointer("/spec/replicas").and_then(|v| v.as_i64())
}

/// Remove leftovers from earlier runs
pub async fn cleanup(client: &Client, appwrapper: &str, machineset: &str) {
    let workloads: Api<AppWrapper> = Api::namespaced(client.clone(), "default");
    if let Ok(Some(mut aw)) = workloads.get_opt(appwrapper).await {
        if aw.metadata.finalizers.take().is_some() {
            let patch = json!({ "metadata": { "finalizers": null } });
            let _ = workloads
                .patch(appwrapper, &PatchParams::default(), &Patch::Merge(&patch))
                .await;
        }
        let _ = workloads.delete(appwrapper, &DeleteParams::default()).await;
    }
    let _ = machinesets(client)
        .delete(machineset, &DeleteParams::default())
        .await;
}
