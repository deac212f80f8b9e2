//! Updater control loop
//!
//! Once per tick: keep the autoscalers whose latest condition says a
//! recommendation is available, bucket the living pods, evict each
//! bucket's pods under the per-owner budget (so they respawn through the
//! admission webhook with the new resources), then write the recommended
//! replica count to the target's scale subresource. Eviction failures
//! never abort the resize and vice versa.

pub mod eviction;
pub mod priority;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{DynamicObject, PostParams};
use kube::runtime::events::EventType;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use mpa_common::crd::{MpaConditionType, MultidimPodAutoscaler, UpdateMode};
use mpa_common::error::Error;
use mpa_common::events::{actions, mpa_object_ref, pod_object_ref, reasons, EventPublisher};
use mpa_common::matcher::{controlling_mpa_for_pod, MpaWithSelector};
use mpa_common::metrics::ExecutionTimer;
use mpa_common::stores::{KindStores, MpaStore, PodStore};
use mpa_common::target::{DiscoveryCache, SelectorFetch};

use crate::eviction::{EvictionApi, EvictionBudget, EvictionConfig};
use crate::priority::PriorityProcessor;

/// Updater over watch-backed stores and the cluster write surfaces
pub struct Updater<F, E> {
    client: Client,
    mpas: MpaStore,
    pods: PodStore,
    kinds: KindStores,
    discovery: DiscoveryCache,
    fetcher: F,
    eviction_api: E,
    events: Arc<dyn EventPublisher>,
    priority: Box<dyn PriorityProcessor>,
    config: EvictionConfig,
}

impl<F: SelectorFetch, E: EvictionApi> Updater<F, E> {
    /// Build the updater; all stores must already be synced
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        mpas: MpaStore,
        pods: PodStore,
        kinds: KindStores,
        discovery: DiscoveryCache,
        fetcher: F,
        eviction_api: E,
        events: Arc<dyn EventPublisher>,
        priority: Box<dyn PriorityProcessor>,
        config: EvictionConfig,
    ) -> Self {
        Self {
            client,
            mpas,
            pods,
            kinds,
            discovery,
            fetcher,
            eviction_api,
            events,
            priority,
            config,
        }
    }

    /// Run ticks forever; a tick must finish before the next starts
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.main_procedure().await;
        }
    }

    /// One full update pass over every actionable autoscaler
    pub async fn main_procedure(&self) {
        let mut timer = ExecutionTimer::updater();

        let mut mpas = Vec::new();
        for mpa in self.mpas.state() {
            if mpa.update_mode() != UpdateMode::Auto {
                debug!(mpa = %mpa.id(), "update mode is Off, skipping");
                continue;
            }
            let provided = mpa
                .latest_condition()
                .map(|c| c.type_ == MpaConditionType::RecommendationProvided)
                .unwrap_or(false);
            let has_recommendation = mpa
                .status
                .as_ref()
                .and_then(|s| s.recommendation_resources.as_ref())
                .is_some();
            if !provided || !has_recommendation {
                debug!(mpa = %mpa.id(), "no actionable recommendation, skipping");
                continue;
            }
            match self.fetcher.fetch(&mpa).await {
                Ok(selector) => mpas.push(MpaWithSelector { mpa, selector }),
                Err(e) => {
                    debug!(mpa = %mpa.id(), error = %e, "cannot fetch target selector, skipping");
                }
            }
        }
        if mpas.is_empty() {
            warn!("no autoscalers to process");
        }
        timer.observe_step("GetMPAs");

        let pods = self.pods.living();
        timer.observe_step("GetPods");

        let mut buckets: HashMap<usize, Vec<Arc<Pod>>> = HashMap::new();
        for pod in pods {
            if let Some(winner) = controlling_mpa_for_pod(&pod, &mpas) {
                if let Some(index) = mpas
                    .iter()
                    .position(|m| Arc::ptr_eq(&m.mpa, &winner.mpa))
                {
                    buckets.entry(index).or_default().push(pod);
                }
            }
        }
        timer.observe_step("FilterPods");

        for (index, pods) in buckets {
            let mpa = &mpas[index].mpa;
            self.update_bucket(mpa, pods).await;
        }
        timer.observe_step("EvictPods");
        timer.observe_total();
    }

    /// Evict the bucket's pods under the budget, then resize the target
    async fn update_bucket(&self, mpa: &MultidimPodAutoscaler, pods: Vec<Arc<Pod>>) {
        let mut budget = EvictionBudget::new(&pods, &self.kinds, &self.config);

        let candidates: Vec<Arc<Pod>> = pods
            .iter()
            .filter(|pod| budget.evictable(pod))
            .cloned()
            .collect();
        let ordered = self.priority.pods_update_order(candidates, mpa);

        for pod in ordered {
            // Budget moves as pods are evicted mid-cycle, so re-check
            if !budget.evictable(&pod) {
                continue;
            }
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            info!(pod = %format!("{namespace}/{name}"), mpa = %mpa.id(), "evicting pod");
            match self.eviction_api.evict(namespace, name).await {
                Ok(()) => {
                    budget.note_evicted(&pod);
                    self.events
                        .publish(
                            &pod_object_ref(&pod),
                            EventType::Normal,
                            reasons::EVICTED_POD,
                            actions::EVICT,
                            Some(format!("Evicted to apply recommendation of {}", mpa.id())),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(pod = %format!("{namespace}/{name}"), error = %e, "eviction failed");
                    self.events
                        .publish(
                            &pod_object_ref(&pod),
                            EventType::Warning,
                            reasons::EVICT_POD_FAILED,
                            actions::EVICT,
                            Some(e.to_string()),
                        )
                        .await;
                }
            }
        }

        if let Err(e) = self.resize_target(mpa).await {
            warn!(mpa = %mpa.id(), error = %e, "replica resize failed");
        }
    }

    /// Write the recommended replica count to the target's scale
    /// subresource, resolved through discovery
    async fn resize_target(&self, mpa: &MultidimPodAutoscaler) -> Result<(), Error> {
        let namespace = mpa
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::configuration_for(mpa.id(), "autoscaler has no namespace"))?;
        let target_ref = mpa
            .spec
            .target_ref
            .as_ref()
            .ok_or_else(|| Error::configuration_for(mpa.id(), "targetRef undefined"))?;
        let new_replicas = mpa
            .status
            .as_ref()
            .and_then(|s| s.recommendation_resources.as_ref())
            .map(|r| r.target_pod_num)
            .ok_or_else(|| Error::configuration_for(mpa.id(), "no recommendation in status"))?;

        let group = target_ref
            .api_version
            .as_deref()
            .unwrap_or_default()
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default();

        let candidates = self
            .discovery
            .resources_for_kind(group, &target_ref.kind)
            .await;
        if candidates.is_empty() {
            let err = Error::configuration_for(
                mpa.id(),
                format!("no API resource found for kind {}", target_ref.kind),
            );
            self.events
                .publish(
                    &mpa_object_ref(mpa),
                    EventType::Warning,
                    reasons::FAILED_GET_SCALE,
                    actions::SCALE,
                    Some(err.to_string()),
                )
                .await;
            return Err(err);
        }

        let mut found = None;
        let mut last_error: Option<kube::Error> = None;
        for resource in candidates {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &resource);
            match api.get_scale(&target_ref.name).await {
                Ok(scale) => {
                    found = Some((api, scale));
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let Some((api, mut scale)) = found else {
            let err = Error::configuration_for(
                mpa.id(),
                format!(
                    "failed to query scale subresource for {}: {}",
                    target_ref.name,
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                ),
            );
            self.events
                .publish(
                    &mpa_object_ref(mpa),
                    EventType::Warning,
                    reasons::FAILED_GET_SCALE,
                    actions::SCALE,
                    Some(err.to_string()),
                )
                .await;
            return Err(err);
        };

        let old_replicas = scale.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        scale.spec.get_or_insert_with(Default::default).replicas = Some(new_replicas);

        let body = serde_json::to_vec(&scale).map_err(|e| Error::serialization(e.to_string()))?;
        match api
            .replace_scale(&target_ref.name, &PostParams::default(), body)
            .await
        {
            Ok(_) => {
                info!(
                    mpa = %mpa.id(),
                    old_replicas,
                    new_replicas,
                    "rescaled target"
                );
                self.events
                    .publish(
                        &mpa_object_ref(mpa),
                        EventType::Normal,
                        reasons::SUCCESSFUL_SCALE,
                        actions::SCALE,
                        Some(format!("New size: {new_replicas}")),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                self.events
                    .publish(
                        &mpa_object_ref(mpa),
                        EventType::Warning,
                        reasons::FAILED_SCALE,
                        actions::SCALE,
                        Some(format!("New size: {new_replicas}; error: {e}")),
                    )
                    .await;
                Err(e.into())
            }
        }
    }
}
