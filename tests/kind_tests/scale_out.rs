//! Scale-out stories
//!
//! Each story drives the reconciler by hand against a live API server. There
//! is no dispatcher in a kind cluster, so the AppWrapper stays `Pending` and
//! InstaScale treats it as waiting for capacity.

use std::sync::Arc;

use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};

use instascale::config::InstaScaleConfig;
use instascale::controller::{reconcile, Context};
use instascale::crd::AppWrapper;
use instascale::POOLS_ANNOTATION;

use super::helpers::{
    cleanup, ensure_test_cluster, machinesets, replicas_of, sample_appwrapper, sample_machineset,
    MACHINESET_NAMESPACE,
};

fn context(client: Client) -> Arc<Context> {
    let config = InstaScaleConfig {
        machine_set_namespace: MACHINESET_NAMESPACE.to_string(),
        ..Default::default()
    };
    Arc::new(Context::builder(client, config).build())
}

async fn reconcile_latest(api: &Api<AppWrapper>, ctx: &Arc<Context>, name: &str) {
    let aw = api.get(name).await.expect("failed to get appwrapper");
    reconcile(Arc::new(aw), ctx.clone())
        .await
        .expect("reconcile failed");
}

/// Story: A data scientist submits a training job that needs one test.instance1 machine
///
/// The cluster already has an idle MachineSet of that type. InstaScale grows it
/// to one replica, records the binding on the AppWrapper, and shrinks it back
/// to zero once the workload is deleted.
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_training_job_grows_matching_machineset_and_gives_it_back() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = context(client.clone());
    let workloads: Api<AppWrapper> = Api::namespaced(client.clone(), "default");
    let (aw_name, ms_name) = ("mnist", "test-instascale");

    cleanup(&client, aw_name, ms_name).await;

    // Arrange: an idle MachineSet for the requested instance type
    machinesets(&client)
        .create(
            &PostParams::default(),
            &sample_machineset(ms_name, "test.instance1"),
        )
        .await
        .expect("failed to create machineset");
    assert_eq!(replicas_of(&client, ms_name).await, Some(0));

    // Act: the job is submitted and reconciled
    workloads
        .create(
            &PostParams::default(),
            &sample_appwrapper(aw_name, "test.instance1", &[1]),
        )
        .await
        .expect("failed to create appwrapper");
    reconcile_latest(&workloads, &ctx, aw_name).await;

    // Assert: the MachineSet now has one replica and the binding is recorded
    assert_eq!(replicas_of(&client, ms_name).await, Some(1));
    let aw = workloads.get(aw_name).await.expect("failed to get appwrapper");
    let bookkeeping = aw
        .annotations()
        .get(POOLS_ANNOTATION)
        .expect("binding should be recorded");
    assert!(bookkeeping.contains(ms_name));

    // Act: a second pass is a no-op
    reconcile_latest(&workloads, &ctx, aw_name).await;
    assert_eq!(replicas_of(&client, ms_name).await, Some(1));

    // Act: the job is deleted and the reconciler sees the deleting object
    workloads
        .delete(aw_name, &DeleteParams::default())
        .await
        .expect("failed to delete appwrapper");
    reconcile_latest(&workloads, &ctx, aw_name).await;

    // Assert: capacity is given back and the finalizer released the object
    assert_eq!(replicas_of(&client, ms_name).await, Some(0));
    assert!(workloads
        .get_opt(aw_name)
        .await
        .expect("failed to query appwrapper")
        .is_none());

    cleanup(&client, aw_name, ms_name).await;
}
