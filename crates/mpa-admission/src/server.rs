//! Admission request handling
//!
//! The webhook is fail-open end to end: every internal failure degrades to
//! `allowed: true` with no patch, and the registration's
//! `failurePolicy=Ignore` covers transport-level failures. A buggy
//! recommendation must never block pod creation.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info};

use mpa_common::error::Error;
use mpa_common::limitrange;
use mpa_common::matcher::Matcher;
use mpa_common::metrics::{
    on_admitted_pod, AdmissionResource, AdmissionStatus, AdmissionTimer,
};
use mpa_common::stores::LimitRangeStore;
use mpa_common::target::SelectorFetch;

use crate::patches::{
    empty_annotations_patch, ObservedPodCalculator, PatchCalculator, ResourceUpdatesCalculator,
};

/// Shared state of the admission handlers
pub struct AdmissionState<F> {
    /// Pod-to-autoscaler matcher
    pub matcher: Matcher<F>,
    /// LimitRange lookups for the recommendation provider
    pub limit_ranges: LimitRangeStore,
}

/// Build the admission router: `POST /` mutates, `GET /healthz` probes
pub fn admission_routes<F: SelectorFetch + 'static>(state: Arc<AdmissionState<F>>) -> Router {
    Router::new()
        .route("/", post(mutate_handler::<F>))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle one mutating admission review for a pod CREATE
async fn mutate_handler<F: SelectorFetch>(
    State(state): State<Arc<AdmissionState<F>>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let timer = AdmissionTimer::start();

    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "cannot parse admission request");
            timer.observe(AdmissionStatus::Error, AdmissionResource::Unknown);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = AdmissionResponse::from(&request);

    // Only core/v1 pods are handled; anything else passes unchanged
    if !request.resource.group.is_empty()
        || request.resource.version != "v1"
        || request.resource.resource != "pods"
    {
        error!(resource = ?request.resource, "unsupported resource in admission request");
        timer.observe(AdmissionStatus::Error, AdmissionResource::Unknown);
        return Json(response.into_review());
    }

    match pod_patches(&state, &request).await {
        Ok(patches) if !patches.is_empty() => {
            match response.with_patch(json_patch::Patch(patches)) {
                Ok(patched) => {
                    on_admitted_pod(true);
                    timer.observe(AdmissionStatus::Applied, AdmissionResource::Pod);
                    Json(patched.into_review())
                }
                Err(e) => {
                    error!(error = %e, "cannot serialize patch, allowing unchanged");
                    on_admitted_pod(false);
                    timer.observe(AdmissionStatus::Error, AdmissionResource::Pod);
                    Json(AdmissionResponse::from(&request).into_review())
                }
            }
        }
        Ok(_) => {
            on_admitted_pod(false);
            timer.observe(AdmissionStatus::Skipped, AdmissionResource::Pod);
            Json(response.into_review())
        }
        Err(e) => {
            error!(error = %e, "admission handling failed, allowing unchanged");
            on_admitted_pod(false);
            timer.observe(AdmissionStatus::Error, AdmissionResource::Pod);
            Json(response.into_review())
        }
    }
}

/// Compute the JSON-Patch for one pod create
async fn pod_patches<F: SelectorFetch>(
    state: &AdmissionState<F>,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Vec<PatchOperation>, Error> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| Error::contract("admission request has no object"))?;
    let mut pod: Pod = serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::contract(format!("object is not a v1 pod: {e}")))?;

    // Pods created through generateName have no name yet; synthesize one
    // so selector debugging stays readable
    if pod.metadata.name.as_deref().unwrap_or_default().is_empty() {
        let generate_name = pod.metadata.generate_name.clone().unwrap_or_default();
        pod.metadata.name = Some(format!("{generate_name}%"));
    }
    if pod.metadata.namespace.is_none() {
        pod.metadata.namespace = Some(request.namespace.clone().unwrap_or_default());
    }

    debug!(
        pod = %pod.metadata.name.as_deref().unwrap_or_default(),
        namespace = %pod.metadata.namespace.as_deref().unwrap_or_default(),
        "admitting pod"
    );

    let Some(mpa) = state.matcher.matching_mpa(&pod).await else {
        debug!(
            pod = %pod.metadata.name.as_deref().unwrap_or_default(),
            "no matching autoscaler"
        );
        return Ok(Vec::new());
    };

    info!(
        pod = %pod.metadata.name.as_deref().unwrap_or_default(),
        mpa = %mpa.id(),
        "rewriting pod resources"
    );

    let mut patches = Vec::new();
    if pod.metadata.annotations.is_none() {
        patches.push(empty_annotations_patch());
    }

    let limit_range = pod
        .metadata
        .namespace
        .as_deref()
        .and_then(|ns| limitrange::container_limits_for(&state.limit_ranges, ns));

    let calculators: Vec<Box<dyn PatchCalculator>> = vec![
        Box::new(ObservedPodCalculator),
        Box::new(ResourceUpdatesCalculator::new(limit_range)),
    ];
    for calculator in &calculators {
        patches.extend(calculator.calculate(&pod, &mpa).await?);
    }

    Ok(patches)
}
