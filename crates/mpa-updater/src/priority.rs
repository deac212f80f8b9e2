//! Eviction ordering
//!
//! The updater asks a priority processor for the order in which a bucket's
//! evictable pods are disrupted. The current strategy keeps the input
//! order; the seam exists so smarter orderings (worst offender first,
//! quota aware) can slot in without touching the loop.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use mpa_common::crd::MultidimPodAutoscaler;

/// Orders a bucket's pods for eviction
pub trait PriorityProcessor: Send + Sync {
    /// Return the pods in the order they should be evicted
    fn pods_update_order(
        &self,
        pods: Vec<Arc<Pod>>,
        mpa: &MultidimPodAutoscaler,
    ) -> Vec<Arc<Pod>>;
}

/// Keeps the input order unchanged
pub struct IdentityPriority;

impl PriorityProcessor for IdentityPriority {
    fn pods_update_order(
        &self,
        pods: Vec<Arc<Pod>>,
        _mpa: &MultidimPodAutoscaler,
    ) -> Vec<Arc<Pod>> {
        pods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpa_common::crd::MultidimPodAutoscalerSpec;

    #[test]
    fn identity_preserves_order() {
        let mpa = MultidimPodAutoscaler::new(
            "web-mpa",
            MultidimPodAutoscalerSpec {
                target_ref: None,
                update_policy: None,
                resource_policy: None,
            },
        );
        let pods: Vec<Arc<Pod>> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                let mut pod = Pod::default();
                pod.metadata.name = Some(name.to_string());
                Arc::new(pod)
            })
            .collect();

        let ordered = IdentityPriority.pods_update_order(pods.clone(), &mpa);
        let names: Vec<_> = ordered
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
