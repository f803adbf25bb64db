//! Kubernetes Event recording for the InstaScale controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that scale-out decisions show up in `kubectl describe appwrapper` and
//! `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::AppWrapper;

/// Reporting component name written on every Event
pub const CONTROLLER_NAME: &str = "instascale-controller";

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ScaledOut")
    /// * `action` - What action was taken (e.g. "ScaleOut")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Object reference for Events about an AppWrapper
pub fn workload_ref(aw: &AppWrapper) -> ObjectReference {
    aw.object_ref(&())
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Every pod group has capacity planned and applied
    pub const SCALED_OUT: &str = "ScaledOut";
    /// The plan would exceed `maxScaleoutAllowed`
    pub const SCALEOUT_CEILING_EXCEEDED: &str = "ScaleoutCeilingExceeded";
    /// A MachineSet with the needed name serves another type or workload
    pub const POOL_NAME_TAKEN: &str = "PoolNameTaken";
    /// The `orderedinstance` label does not match the pod groups
    pub const MALFORMED_PREFERENCE: &str = "MalformedPreference";
    /// A shared pool was shrunk on teardown
    pub const SCALED_DOWN: &str = "ScaledDown";
    /// A dedicated pool was deleted on teardown
    pub const POOL_DELETED: &str = "PoolDeleted";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Planning and applying a scale-out
    pub const SCALE_OUT: &str = "ScaleOut";
    /// Releasing capacity on completion or deletion
    pub const TEARDOWN: &str = "Teardown";
    /// Reading the workload's instance preference
    pub const PLAN: &str = "Plan";
}
