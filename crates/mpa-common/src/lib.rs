//! Common types for the multidimensional pod autoscaler: the
//! MultidimPodAutoscaler CRD, label-selector matching, target resolution,
//! resource arithmetic, errors, events and metrics.

pub mod client;
pub mod crd;
pub mod error;
pub mod events;
pub mod limitrange;
pub mod limits;
pub mod matcher;
pub mod metrics;
pub mod quantity;
pub mod recommendation;
pub mod selector;
pub mod stores;
pub mod target;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the mutating webhook configuration object upserted on startup
pub const WEBHOOK_CONFIG_NAME: &str = "mpa-webhook-config";

/// Annotation marking a pod as observed by the autoscaler; the value is the
/// comma-joined list of container names
pub const OBSERVED_POD_ANNOTATION: &str = "mpaObservedPod";

/// Annotation summarizing the resource fields rewritten at admission
pub const RESOURCE_UPDATES_ANNOTATION: &str = "MpaUpdates";

/// Separator between container names in the observed-pod annotation value
pub const CONTAINER_NAME_SEPARATOR: &str = ", ";

/// Metric consumed by the recommender, one sample per controlled pod
pub const QPS_METRIC_NAME: &str = "http_requests";

/// Join container names for the observed-pod annotation value
pub fn observed_pod_annotation_value(pod: &k8s_openapi::api::core::v1::Pod) -> String {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(CONTAINER_NAME_SEPARATOR)
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};

    #[test]
    fn observed_pod_value_joins_container_names() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![
                    Container {
                        name: "app".into(),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(observed_pod_annotation_value(&pod), "app, sidecar");
    }

    #[test]
    fn observed_pod_value_empty_without_spec() {
        assert_eq!(observed_pod_annotation_value(&Pod::default()), "");
    }
}
