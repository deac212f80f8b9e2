//! Admission-side recommendation provider
//!
//! Turns the recommendation published on an autoscaler into concrete
//! per-container `{requests, limits}` for one pod being created. Requests
//! become the target; limits follow proportionally so the original
//! request:limit ratio survives the rewrite.

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use mpa_common::crd::{container_recommendation, MultidimPodAutoscaler, UpdateMode};
use mpa_common::error::Error;
use mpa_common::limitrange::AggregatedLimits;
use mpa_common::limits::{proportional_limit, ContainerResources};
use mpa_common::recommendation::ContainerAnnotations;

/// Per-container resources for a pod, aligned with `pod.spec.containers`;
/// `None` entries had no recommendation and are left untouched
pub fn container_resources_for_pod(
    pod: &Pod,
    mpa: &MultidimPodAutoscaler,
    limit_range: Option<&AggregatedLimits>,
) -> Result<(Vec<Option<ContainerResources>>, ContainerAnnotations), Error> {
    let mut annotations = ContainerAnnotations::new();

    let Some(recommendation) = mpa
        .status
        .as_ref()
        .and_then(|s| s.recommendation_resources.as_ref())
    else {
        return Ok((Vec::new(), annotations));
    };

    // Off-mode autoscalers never mutate pods; the matcher filters them,
    // but the provider guards as well since it is reachable on its own
    if mpa.update_mode() == UpdateMode::Off {
        return Ok((Vec::new(), annotations));
    }

    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let default_limit = limit_range.map(|l| &l.default);

    let mut resources = Vec::with_capacity(containers.len());
    for container in containers {
        let recommended = container_recommendation(
            &container.name,
            &recommendation.container_recommendations,
        )
        .or_else(|| {
            container_recommendation(
                mpa_common::crd::WILDCARD_CONTAINER,
                &recommendation.container_recommendations,
            )
        });

        let Some(recommended) = recommended else {
            debug!(container = %container.name, "no matching recommendation, leaving untouched");
            resources.push(None);
            continue;
        };

        let requests = recommended.target.clone();
        let (limits, limit_annotations) = proportional_limit(
            container.resources.as_ref().and_then(|r| r.limits.as_ref()),
            container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref()),
            &requests,
            default_limit,
        );

        let mut container_annotations = limit_annotations;
        let limits = match limits {
            Some(limits) => limits,
            None => {
                container_annotations
                    .push("no limit to scale, setting limits equal to requests".to_string());
                requests.clone()
            }
        };
        if !container_annotations.is_empty() {
            annotations.insert(container.name.clone(), container_annotations);
        }

        resources.push(Some(ContainerResources { requests, limits }));
    }

    Ok((resources, annotations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use mpa_common::crd::{
        MultidimPodAutoscalerSpec, MultidimPodAutoscalerStatus, PodUpdatePolicy,
        RecommendedContainerResources, RecommendedResources, ResourceList, WILDCARD_CONTAINER,
    };

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn pod_with_resources(requests: Option<&[(&str, &str)]>, limits: Option<&[(&str, &str)]>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    resources: Some(ResourceRequirements {
                        requests: requests.map(|r| list(r).into_iter().collect()),
                        limits: limits.map(|l| list(l).into_iter().collect()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mpa_with_target(cpu: &str, mode: Option<UpdateMode>) -> MultidimPodAutoscaler {
        let mut mpa = MultidimPodAutoscaler::new(
            "web-mpa",
            MultidimPodAutoscalerSpec {
                target_ref: None,
                update_policy: mode.map(|m| PodUpdatePolicy {
                    update_mode: Some(m),
                }),
                resource_policy: None,
            },
        );
        mpa.status = Some(MultidimPodAutoscalerStatus {
            recommendation_resources: Some(RecommendedResources {
                target_pod_num: 4,
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: WILDCARD_CONTAINER.into(),
                    target: list(&[("cpu", cpu)]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            conditions: vec![],
        });
        mpa
    }

    /// requests 100m / limits 200m with a 150m target must produce a 300m
    /// limit on the rewritten pod.
    #[test]
    fn story_proportional_limit_on_admission() {
        let pod = pod_with_resources(Some(&[("cpu", "100m")]), Some(&[("cpu", "200m")]));
        let mpa = mpa_with_target("150m", None);
        let (resources, _) = container_resources_for_pod(&pod, &mpa, None).unwrap();

        let resources = resources[0].as_ref().unwrap();
        assert_eq!(resources.requests.get("cpu").unwrap().0, "150m");
        assert_eq!(resources.limits.get("cpu").unwrap().0, "300m");
    }

    #[test]
    fn equal_request_and_limit_keep_them_equal() {
        let pod = pod_with_resources(Some(&[("cpu", "500m")]), Some(&[("cpu", "500m")]));
        let mpa = mpa_with_target("1500m", None);
        let (resources, _) = container_resources_for_pod(&pod, &mpa, None).unwrap();

        let resources = resources[0].as_ref().unwrap();
        assert_eq!(resources.requests.get("cpu").unwrap().0, "1500m");
        assert_eq!(resources.limits.get("cpu").unwrap().0, "1500m");
    }

    #[test]
    fn no_limit_anywhere_sets_limits_to_requests() {
        let pod = pod_with_resources(Some(&[("cpu", "100m")]), None);
        let mpa = mpa_with_target("750m", None);
        let (resources, annotations) = container_resources_for_pod(&pod, &mpa, None).unwrap();

        let resources = resources[0].as_ref().unwrap();
        assert_eq!(resources.limits, resources.requests);
        assert!(annotations.get("app").unwrap()[0].contains("equal to requests"));
    }

    #[test]
    fn limit_range_default_seeds_the_limit() {
        let pod = pod_with_resources(Some(&[("cpu", "100m")]), None);
        let mpa = mpa_with_target("200m", None);
        let limits = AggregatedLimits {
            min: ResourceList::new(),
            max: ResourceList::new(),
            default: list(&[("cpu", "400m")]),
        };
        let (resources, _) = container_resources_for_pod(&pod, &mpa, Some(&limits)).unwrap();

        // default 400m over request 100m: ratio 4 -> 800m
        let resources = resources[0].as_ref().unwrap();
        assert_eq!(resources.limits.get("cpu").unwrap().0, "800m");
    }

    #[test]
    fn off_mode_produces_nothing() {
        let pod = pod_with_resources(Some(&[("cpu", "100m")]), None);
        let mpa = mpa_with_target("750m", Some(UpdateMode::Off));
        let (resources, _) = container_resources_for_pod(&pod, &mpa, None).unwrap();
        assert!(resources.is_empty());
    }

    #[test]
    fn missing_status_produces_nothing() {
        let pod = pod_with_resources(None, None);
        let mut mpa = mpa_with_target("750m", None);
        mpa.status = None;
        let (resources, _) = container_resources_for_pod(&pod, &mpa, None).unwrap();
        assert!(resources.is_empty());
    }

    #[test]
    fn unmatched_container_is_left_untouched() {
        let pod = pod_with_resources(None, None);
        let mut mpa = mpa_with_target("750m", None);
        mpa.status
            .as_mut()
            .unwrap()
            .recommendation_resources
            .as_mut()
            .unwrap()
            .container_recommendations[0]
            .container_name = "other".into();
        let (resources, _) = container_resources_for_pod(&pod, &mpa, None).unwrap();
        assert_eq!(resources.len(), 1);
        assert!(resources[0].is_none());
    }
}
