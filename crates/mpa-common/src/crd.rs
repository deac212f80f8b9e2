//! MultidimPodAutoscaler Custom Resource Definition
//!
//! The MultidimPodAutoscaler (MPA) drives simultaneous rightsizing of a
//! workload across two dimensions: per-pod CPU and replica count. The
//! recommender writes `.status.recommendationResources`, the updater enacts
//! it (eviction + scale subresource) and the admission webhook applies it to
//! newly created pods.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Map of resource name ("cpu", "memory") to quantity
pub type ResourceList = BTreeMap<String, Quantity>;

/// Container name wildcard: a policy or recommendation with this name
/// applies to every container of the pod
pub const WILDCARD_CONTAINER: &str = "*";

/// Field manager used for server-side apply of the CRD and webhook config
pub const FIELD_MANAGER: &str = "mpa-controller";

/// Reference to the controller owning the pods to autoscale
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// API version of the referent (e.g. "apps/v1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referent (Deployment, StatefulSet, ...)
    pub kind: String,
    /// Name of the referent
    pub name: String,
}

/// How recommendations are enacted on pods
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateMode {
    /// Recommendations are computed but never applied: no eviction, no
    /// admission mutation
    Off,
    /// Recommendations are applied at pod creation and to running pods
    #[default]
    Auto,
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Auto => write!(f, "Auto"),
        }
    }
}

/// Update policy of an autoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodUpdatePolicy {
    /// Defaults to `Auto` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
}

/// Whether limits follow requests proportionally or stay untouched
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerControlledMode {
    /// Requests and limits are both scaled, preserving their ratio
    #[default]
    RequestsAndLimits,
    /// Only requests are scaled
    RequestsOnly,
}

/// Whether the autoscaler applies to a container at all
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerScalingMode {
    /// Recommendations apply to this container
    #[default]
    Auto,
    /// This container is left alone
    Off,
}

/// Per-container resource policy (user configuration consumed by the
/// recommendation processor)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    /// Container name, or `*` to apply to all containers
    #[serde(default)]
    pub container_name: String,

    /// Whether the autoscaler applies to this container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerScalingMode>,

    /// Lower bound for recommended resources (unbounded when empty)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allowed: ResourceList,

    /// Upper bound for recommended resources (unbounded when empty)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allowed: ResourceList,

    /// Expected response time of one request, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_resp_time: Option<i64>,

    /// How limits are derived from requests; defaults to RequestsAndLimits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_mode: Option<ContainerControlledMode>,

    /// Resource names governed by this policy; defaults to cpu and memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_resources: Option<Vec<String>>,
}

/// Resource policy covering all containers of the target's pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    /// Per-container policies; `containerName: "*"` is the fallback entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// Specification of a MultidimPodAutoscaler
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.mpa.dev",
    version = "v1",
    kind = "MultidimPodAutoscaler",
    plural = "multidimpodautoscalers",
    shortname = "mpa",
    namespaced,
    status = "MultidimPodAutoscalerStatus",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.updatePolicy.updateMode"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.recommendationResources.targetPodNum"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerSpec {
    /// Controller whose pods are autoscaled (Deployment, StatefulSet, ...
    /// or anything exposing the scale subresource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,

    /// How recommendations are enacted; defaults to Auto
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<PodUpdatePolicy>,

    /// Bounds and expectations the recommendation must honor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

/// Recommended resources for one container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    /// Container name (`*` when the recommendation applies to all)
    #[serde(default)]
    pub container_name: String,

    /// Recommended amount, applied as the new requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target: ResourceList,

    /// Lower bound below which the workload degrades
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lower_bound: ResourceList,

    /// Upper bound above which resources are wasted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upper_bound: ResourceList,

    /// Target before policy and LimitRange capping; informational only
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uncapped_target: ResourceList,
}

/// Recommendation produced by the engine: a replica count plus per-container
/// resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedResources {
    /// Recommended replica count, applied to the scale subresource
    #[serde(default)]
    pub target_pod_num: i32,

    /// Lower bound on the replica count
    #[serde(default)]
    pub lower_bound_pod_num: i32,

    /// Upper bound on the replica count
    #[serde(default)]
    pub upper_bound_pod_num: i32,

    /// Replica count before capping; informational only
    #[serde(default)]
    pub uncapped_target_pod_num: i32,

    /// Per-container resource recommendations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

/// Condition type reported by the recommender
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MpaConditionType {
    /// A recommendation is available and may be enacted
    RecommendationProvided,
    /// The latest computation did not improve on the published policy
    RecommendationSkipped,
    /// The selector matched no pods
    NoPodsMatched,
}

impl std::fmt::Display for MpaConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecommendationProvided => write!(f, "RecommendationProvided"),
            Self::RecommendationSkipped => write!(f, "RecommendationSkipped"),
            Self::NoPodsMatched => write!(f, "NoPodsMatched"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Timestamped condition entry appended by the recommender
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MpaCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: MpaConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl MpaCondition {
    /// Create a new condition with the current timestamp
    pub fn new(type_: MpaConditionType, reason: impl Into<String>) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            last_transition_time: Utc::now(),
            reason: reason.into(),
            message: String::new(),
        }
    }
}

/// Observed state of a MultidimPodAutoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerStatus {
    /// Latest published recommendation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_resources: Option<RecommendedResources>,

    /// History of recommender decisions, newest last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MpaCondition>,
}

impl MultidimPodAutoscaler {
    /// Effective update mode: absent policy or mode means Auto
    pub fn update_mode(&self) -> UpdateMode {
        self.spec
            .update_policy
            .as_ref()
            .and_then(|p| p.update_mode)
            .unwrap_or(UpdateMode::Auto)
    }

    /// The most recently appended condition, if any
    pub fn latest_condition(&self) -> Option<&MpaCondition> {
        self.status.as_ref().and_then(|s| s.conditions.last())
    }

    /// `namespace/name` identifier used in logs and errors
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Expected per-request response time in milliseconds, read from the
    /// first container policy when present
    pub fn expected_response_time_ms(&self) -> Option<i64> {
        self.spec
            .resource_policy
            .as_ref()
            .and_then(|p| p.container_policies.first())
            .and_then(|p| p.exp_resp_time)
    }
}

/// Resolve the policy governing a container: an exact name match wins,
/// otherwise the `*` wildcard entry applies
pub fn container_policy_for<'a>(
    container_name: &str,
    policy: Option<&'a PodResourcePolicy>,
) -> Option<&'a ContainerResourcePolicy> {
    let policy = policy?;
    let mut fallback = None;
    for container_policy in &policy.container_policies {
        if container_policy.container_name == container_name {
            return Some(container_policy);
        }
        if container_policy.container_name == WILDCARD_CONTAINER {
            fallback = Some(container_policy);
        }
    }
    fallback
}

/// Effective controlled mode for a container; defaults to RequestsAndLimits
pub fn container_controlled_mode(
    container_name: &str,
    policy: Option<&PodResourcePolicy>,
) -> ContainerControlledMode {
    container_policy_for(container_name, policy)
        .and_then(|p| p.controlled_mode)
        .unwrap_or_default()
}

/// Find the recommendation entry for a container by name
pub fn container_recommendation<'a>(
    container_name: &str,
    recommendations: &'a [RecommendedContainerResources],
) -> Option<&'a RecommendedContainerResources> {
    recommendations
        .iter()
        .find(|r| r.container_name == container_name)
}

/// Install (or update) the MultidimPodAutoscaler CRD via server-side apply
pub async fn install_crd(client: &Client) -> crate::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    crds.patch(
        "multidimpodautoscalers.autoscaling.mpa.dev",
        &params,
        &Patch::Apply(&MultidimPodAutoscaler::crd()),
    )
    .await?;
    tracing::info!("MultidimPodAutoscaler CRD installed");
    Ok(())
}
