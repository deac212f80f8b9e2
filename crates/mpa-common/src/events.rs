//! Kubernetes Event recording for the autoscaler loops
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the updater can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break a control-loop tick.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::MultidimPodAutoscaler;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
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
    /// Create a new publisher for the given component name.
    ///
    /// The component name appears as the "reportingComponent" on Events
    /// (e.g. "mpa-updater").
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: None,
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
        let event = kube::runtime::events::Event {
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

/// No-op implementation for tests.
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
        // intentionally empty
    }
}

/// Build an ObjectReference for events on an autoscaler object
pub fn mpa_object_ref(mpa: &MultidimPodAutoscaler) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!(
            "{}/{}",
            MultidimPodAutoscaler::group(&()),
            MultidimPodAutoscaler::version(&())
        )),
        kind: Some(MultidimPodAutoscaler::kind(&()).to_string()),
        name: mpa.metadata.name.clone(),
        namespace: mpa.metadata.namespace.clone(),
        uid: mpa.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Build an ObjectReference for events on a pod
pub fn pod_object_ref(pod: &k8s_openapi::api::core::v1::Pod) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        uid: pod.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Replica count written to the scale subresource
    pub const SUCCESSFUL_SCALE: &str = "SuccessfulScale";
    /// Scale subresource update failed
    pub const FAILED_SCALE: &str = "FailedScale";
    /// Scale subresource could not be resolved or read
    pub const FAILED_GET_SCALE: &str = "FailedGetScale";
    /// A pod was evicted so it respawns through admission
    pub const EVICTED_POD: &str = "EvictedPod";
    /// An eviction API call failed
    pub const EVICT_POD_FAILED: &str = "EvictPodFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Writing the recommended replica count
    pub const SCALE: &str = "Scale";
    /// Evicting a pod under the disruption budget
    pub const EVICT: &str = "Evict";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MultidimPodAutoscalerSpec;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::SUCCESSFUL_SCALE, "SuccessfulScale");
        assert_eq!(reasons::EVICTED_POD, "EvictedPod");
        assert_eq!(actions::EVICT, "Evict");
    }

    #[test]
    fn mpa_object_ref_carries_identity() {
        let mut mpa = MultidimPodAutoscaler::new(
            "web-mpa",
            MultidimPodAutoscalerSpec {
                target_ref: None,
                update_policy: None,
                resource_policy: None,
            },
        );
        mpa.metadata.namespace = Some("default".into());
        let obj_ref = mpa_object_ref(&mpa);
        assert_eq!(obj_ref.kind.as_deref(), Some("MultidimPodAutoscaler"));
        assert_eq!(obj_ref.name.as_deref(), Some("web-mpa"));
        assert_eq!(obj_ref.namespace.as_deref(), Some("default"));
        assert_eq!(obj_ref.api_version.as_deref(), Some("autoscaling.mpa.dev/v1"));
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::SUCCESSFUL_SCALE,
                actions::SCALE,
                Some("New size: 4".to_string()),
            )
            .await;
    }
}
