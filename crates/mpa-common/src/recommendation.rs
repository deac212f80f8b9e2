//! Recommendation post-processing
//!
//! A raw engine recommendation is clamped to the user's per-container
//! policy (`minAllowed`/`maxAllowed`) and to the namespace container
//! LimitRange before it is published or applied. Clamps on the target are
//! recorded as annotations so admission can surface them on the pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};

use crate::crd::{
    container_policy_for, ContainerResourcePolicy, PodResourcePolicy, RecommendedResources,
    ResourceList,
};
use crate::error::Error;
use crate::limitrange::AggregatedLimits;
use crate::quantity;

/// Container name to the annotations produced while adjusting it
pub type ContainerAnnotations = BTreeMap<String, Vec<String>>;

/// Clamp a recommendation to the resource policy and the namespace
/// container LimitRange.
///
/// Containers named in the recommendation but absent from the pod are
/// dropped. `target` clamps are annotated; bounds are clamped silently.
pub fn adjust_recommendation(
    recommendation: &RecommendedResources,
    policy: Option<&PodResourcePolicy>,
    pod: &Pod,
    limit_range: Option<&AggregatedLimits>,
) -> Result<(RecommendedResources, ContainerAnnotations), Error> {
    let mut adjusted = recommendation.clone();
    let mut annotations = ContainerAnnotations::new();

    let mut kept = Vec::with_capacity(adjusted.container_recommendations.len());
    for mut container_rec in adjusted.container_recommendations.drain(..) {
        let Some(container) = pod_container(pod, &container_rec.container_name) else {
            tracing::debug!(
                container = %container_rec.container_name,
                pod = %pod.metadata.name.as_deref().unwrap_or_default(),
                "no matching pod container for recommendation, dropping"
            );
            continue;
        };
        let container_policy = container_policy_for(&container.name, policy);

        let target_annotations = adjust_resource_list(
            &mut container_rec.target,
            container_policy,
            limit_range,
            true,
        );
        adjust_resource_list(
            &mut container_rec.lower_bound,
            container_policy,
            limit_range,
            false,
        );
        adjust_resource_list(
            &mut container_rec.upper_bound,
            container_policy,
            limit_range,
            false,
        );

        if !target_annotations.is_empty() {
            annotations.insert(container.name.clone(), target_annotations);
        }
        kept.push(container_rec);
    }
    adjusted.container_recommendations = kept;

    Ok((adjusted, annotations))
}

/// Clamp one resource list; returns annotations when `annotate` is set
fn adjust_resource_list(
    resources: &mut ResourceList,
    policy: Option<&ContainerResourcePolicy>,
    limit_range: Option<&AggregatedLimits>,
    annotate: bool,
) -> Vec<String> {
    let mut annotations = Vec::new();

    for (name, value) in resources.iter_mut() {
        if let Some(policy) = policy {
            if clamp_min(value, policy.min_allowed.get(name)) && annotate {
                annotations.push(format!("{name}: adjusted to min allowed"));
            }
            if clamp_max(value, policy.max_allowed.get(name)) && annotate {
                annotations.push(format!("{name}: adjusted to max allowed"));
            }
        }
        if let Some(limits) = limit_range {
            let min = limits.min.get(name);
            let max = limits.max.get(name);
            if let (Some(min), Some(max)) = (min, max) {
                if quantity::cmp(min, max)
                    .map(|o| o == std::cmp::Ordering::Greater)
                    .unwrap_or(false)
                {
                    tracing::warn!(
                        resource = %name,
                        min = %min.0,
                        max = %max.0,
                        "limit range min exceeds max, honoring max"
                    );
                    // Max is applied last below, so it wins
                }
            }
            if clamp_min(value, min) && annotate {
                annotations.push(format!("{name}: adjusted to limit range min"));
            }
            if clamp_max(value, max) && annotate {
                annotations.push(format!("{name}: adjusted to limit range max"));
            }
        }
    }

    annotations
}

/// Raise `value` to `min` when it falls below; true when clamped
fn clamp_min(
    value: &mut k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    min: Option<&k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> bool {
    let Some(min) = min else { return false };
    if quantity::is_zero(Some(min)) {
        return false;
    }
    if quantity::cmp(value, min)
        .map(|o| o == std::cmp::Ordering::Less)
        .unwrap_or(false)
    {
        *value = min.clone();
        return true;
    }
    false
}

/// Lower `value` to `max` when it exceeds; true when clamped
fn clamp_max(
    value: &mut k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    max: Option<&k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> bool {
    let Some(max) = max else { return false };
    if quantity::is_zero(Some(max)) {
        return false;
    }
    if quantity::cmp(value, max)
        .map(|o| o == std::cmp::Ordering::Greater)
        .unwrap_or(false)
    {
        *value = max.clone();
        return true;
    }
    false
}

fn pod_container<'a>(pod: &'a Pod, name: &str) -> Option<&'a Container> {
    pod.spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|c| c.name == name || name == crate::crd::WILDCARD_CONTAINER)
}
