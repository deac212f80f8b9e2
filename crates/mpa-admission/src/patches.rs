//! Pod patch calculators
//!
//! The admission handler runs a fixed sequence of calculators over the pod
//! and its controlling autoscaler; each contributes JSON-Patch operations.
//! The order of operations matters: container resource maps must exist
//! before values are added into them.

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;

use mpa_common::crd::MultidimPodAutoscaler;
use mpa_common::error::Error;
use mpa_common::limitrange::AggregatedLimits;
use mpa_common::limits::ContainerResources;
use mpa_common::{
    observed_pod_annotation_value, OBSERVED_POD_ANNOTATION, RESOURCE_UPDATES_ANNOTATION,
};

use crate::provider::container_resources_for_pod;

/// Produces a slice of the pod mutation for one (pod, autoscaler) pair
#[async_trait]
pub trait PatchCalculator: Send + Sync {
    /// JSON-Patch operations to append, in order
    async fn calculate(
        &self,
        pod: &Pod,
        mpa: &MultidimPodAutoscaler,
    ) -> Result<Vec<PatchOperation>, Error>;
}

/// `add /metadata/annotations = {}` for pods that carry none yet; must be
/// first so later annotation adds have a parent object
pub fn empty_annotations_patch() -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["metadata", "annotations"]),
        value: json!({}),
    })
}

fn annotation_patch(name: &str, value: &str) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["metadata", "annotations", name]),
        value: json!(value),
    })
}

/// Marks the pod as observed by writing the container-name list annotation
pub struct ObservedPodCalculator;

#[async_trait]
impl PatchCalculator for ObservedPodCalculator {
    async fn calculate(
        &self,
        pod: &Pod,
        _mpa: &MultidimPodAutoscaler,
    ) -> Result<Vec<PatchOperation>, Error> {
        Ok(vec![annotation_patch(
            OBSERVED_POD_ANNOTATION,
            &observed_pod_annotation_value(pod),
        )])
    }
}

/// Rewrites container resources to the current recommendation
pub struct ResourceUpdatesCalculator {
    limit_range: Option<AggregatedLimits>,
}

impl ResourceUpdatesCalculator {
    /// Build with the namespace's aggregated container LimitRange, if any
    pub fn new(limit_range: Option<AggregatedLimits>) -> Self {
        Self { limit_range }
    }
}

#[async_trait]
impl PatchCalculator for ResourceUpdatesCalculator {
    async fn calculate(
        &self,
        pod: &Pod,
        mpa: &MultidimPodAutoscaler,
    ) -> Result<Vec<PatchOperation>, Error> {
        let (resources, mut annotations) =
            container_resources_for_pod(pod, mpa, self.limit_range.as_ref())?;

        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();

        let mut patches = Vec::new();
        let mut update_summaries = Vec::new();

        for (index, resources) in resources.iter().enumerate() {
            let Some(resources) = resources else {
                continue;
            };
            let container = &containers[index];
            let (container_patches, touched) =
                container_resource_patches(container, index, resources);
            patches.extend(container_patches);

            if !touched.is_empty() {
                annotations.entry(container.name.clone()).or_default();
                update_summaries.push(format!("container {index}: {}", touched.join(", ")));
            }
        }

        if !update_summaries.is_empty() {
            let value = format!(
                "Pod resources updated by {}: {}",
                mpa.metadata.name.as_deref().unwrap_or_default(),
                update_summaries.join("; ")
            );
            patches.push(annotation_patch(RESOURCE_UPDATES_ANNOTATION, &value));
        }

        Ok(patches)
    }
}

/// Ops for one container, in the order the pod document needs them, plus
/// the `<resource>-<field>` tags for the summary annotation
fn container_resource_patches(
    container: &k8s_openapi::api::core::v1::Container,
    index: usize,
    resources: &ContainerResources,
) -> (Vec<PatchOperation>, Vec<String>) {
    let mut patches = Vec::new();
    let mut touched = Vec::new();

    let existing = container.resources.as_ref();
    let has_requests = existing.map(|r| r.requests.is_some()).unwrap_or(false);
    let has_limits = existing.map(|r| r.limits.is_some()).unwrap_or(false);

    let container_token = index.to_string();

    if !has_requests && !has_limits {
        patches.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens([
                "spec",
                "containers",
                container_token.as_str(),
                "resources",
            ]),
            value: json!({}),
        }));
    }

    for (field, present, values) in [
        ("requests", has_requests, &resources.requests),
        ("limits", has_limits, &resources.limits),
    ] {
        if !present && !values.is_empty() {
            patches.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    container_token.as_str(),
                    "resources",
                    field,
                ]),
                value: json!({}),
            }));
        }
        for (name, quantity) in values {
            patches.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    container_token.as_str(),
                    "resources",
                    field,
                    name.as_str(),
                ]),
                value: json!(quantity.0),
            }));
            touched.push(format!("{name}-{field}"));
        }
    }

    (patches, touched)
}
