//! Recommender control loop
//!
//! Once per tick: list autoscalers, resolve their selectors, bucket the
//! living pods, aggregate each bucket's QPS and run the grid evaluation.
//! When the result beats the published policy, the adjusted recommendation
//! is written into the autoscaler's status. Status writes are the only
//! side effect of this loop.

pub mod engine;
pub mod qps;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use mpa_common::crd::{
    MpaCondition, MpaConditionType, MultidimPodAutoscaler, MultidimPodAutoscalerStatus,
    RecommendedContainerResources, RecommendedResources, UpdateMode, WILDCARD_CONTAINER,
};
use mpa_common::error::Error;
use mpa_common::limitrange;
use mpa_common::matcher::{controlling_mpa_for_pod, MpaWithSelector};
use mpa_common::metrics::ExecutionTimer;
use mpa_common::quantity::{format_milli, parse_milli};
use mpa_common::recommendation::adjust_recommendation;
use mpa_common::stores::{LimitRangeStore, MpaStore, PodStore};
use mpa_common::target::SelectorFetch;

use crate::engine::DEFAULT_RESPONSE_TIME_MS;
use crate::qps::{PodId, QpsProvider};

/// Recommender over watch-backed stores, a selector fetcher and a QPS
/// provider
pub struct Recommender<F, Q> {
    client: Client,
    mpas: MpaStore,
    pods: PodStore,
    limit_ranges: LimitRangeStore,
    fetcher: F,
    qps: Q,
}

impl<F: SelectorFetch, Q: QpsProvider> Recommender<F, Q> {
    /// Build the recommender; all stores must already be synced
    pub fn new(
        client: Client,
        mpas: MpaStore,
        pods: PodStore,
        limit_ranges: LimitRangeStore,
        fetcher: F,
        qps: Q,
    ) -> Self {
        Self {
            client,
            mpas,
            pods,
            limit_ranges,
            fetcher,
            qps,
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

    /// One full recommendation pass over every autoscaler
    pub async fn main_procedure(&self) {
        let mut timer = ExecutionTimer::recommender();

        let mut mpas = Vec::new();
        for mpa in self.mpas.state() {
            if mpa.update_mode() != UpdateMode::Auto {
                debug!(mpa = %mpa.id(), "update mode is Off, skipping");
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
            if let Some(index) = controlling_index(&pod, &mpas) {
                buckets.entry(index).or_default().push(pod);
            }
        }
        timer.observe_step("FilterPods");

        for (index, pods) in buckets {
            let mws = &mpas[index];
            if pods.is_empty() {
                info!(mpa = %mws.mpa.id(), "controls no pods");
                continue;
            }
            if let Err(e) = self.recommend_for_mpa(mws, &pods).await {
                warn!(mpa = %mws.mpa.id(), error = %e, "recommendation failed");
            }
        }
        timer.observe_step("Recommend");
        timer.observe_total();
    }

    /// Aggregate QPS, evaluate the grid and update `.status` when the new
    /// policy is worth publishing
    async fn recommend_for_mpa(
        &self,
        mws: &MpaWithSelector,
        pods: &[Arc<Pod>],
    ) -> Result<(), Error> {
        let mpa = &mws.mpa;
        let namespace = mpa
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::configuration_for(mpa.id(), "autoscaler has no namespace"))?;

        let samples = self.qps.pod_qps(namespace, &mws.selector).await?;

        let mut total_milli: i64 = 0;
        let mut sampled = 0usize;
        for pod in pods {
            let id = PodId {
                namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                name: pod.metadata.name.clone().unwrap_or_default(),
            };
            match samples.get(&id) {
                Some(milli) => {
                    total_milli += milli;
                    sampled += 1;
                }
                None => {
                    info!(pod = %format!("{}/{}", id.namespace, id.name), "no QPS sample for pod");
                }
            }
        }
        if sampled == 0 {
            return Err(Error::missing_metric(namespace, mws.selector.to_string()));
        }
        let qps = total_milli as f64 / 1000.0;

        let expected_ms = mpa
            .expected_response_time_ms()
            .unwrap_or(DEFAULT_RESPONSE_TIME_MS);

        let old_score = published_policy(mpa)
            .map(|(cpu_milli, replicas)| engine::score_policy(cpu_milli, replicas, qps, expected_ms))
            .unwrap_or(0.0);
        let best = engine::recommend(qps, expected_ms);

        debug!(
            mpa = %mpa.id(),
            qps,
            new_score = best.score,
            old_score,
            replicas = best.replicas,
            cpu_milli = best.cpu_milli,
            "grid evaluation finished"
        );

        let (recommendation, condition) = if best.score <= 0.0 {
            // No feasible policy on the grid for this load
            (
                None,
                MpaCondition::new(MpaConditionType::RecommendationSkipped, "Recommendation Unknown"),
            )
        } else if engine::should_publish(best.score, old_score) {
            let raw = RecommendedResources {
                target_pod_num: best.replicas as i32,
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: WILDCARD_CONTAINER.into(),
                    target: [("cpu".to_string(), format_milli(best.cpu_milli))]
                        .into_iter()
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            };
            let limit_range = limitrange::container_limits_for(&self.limit_ranges, namespace);
            let (adjusted, _annotations) = adjust_recommendation(
                &raw,
                mpa.spec.resource_policy.as_ref(),
                &pods[0],
                limit_range.as_ref(),
            )?;
            (
                Some(adjusted),
                MpaCondition::new(
                    MpaConditionType::RecommendationProvided,
                    "Recommendation Provided",
                ),
            )
        } else {
            (
                None,
                MpaCondition::new(MpaConditionType::RecommendationSkipped, "Recommendation Skipped"),
            )
        };

        self.update_status(mpa, recommendation, condition).await
    }

    /// Append the condition (and the recommendation when published) and
    /// replace the status subresource. Last writer wins.
    async fn update_status(
        &self,
        mpa: &MultidimPodAutoscaler,
        recommendation: Option<RecommendedResources>,
        condition: MpaCondition,
    ) -> Result<(), Error> {
        let namespace = mpa.metadata.namespace.as_deref().unwrap_or_default();
        let name = mpa
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("autoscaler has no name"))?;

        let mut updated = mpa.clone();
        let status = updated
            .status
            .get_or_insert_with(MultidimPodAutoscalerStatus::default);
        if let Some(recommendation) = recommendation {
            status.recommendation_resources = Some(recommendation);
        }
        status.conditions.push(condition);

        let api: Api<MultidimPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let body =
            serde_json::to_vec(&updated).map_err(|e| Error::serialization(e.to_string()))?;
        api.replace_status(name, &PostParams::default(), body).await?;
        Ok(())
    }
}

/// Index of the controlling autoscaler in `mpas` for this pod
fn controlling_index(pod: &Pod, mpas: &[MpaWithSelector]) -> Option<usize> {
    let winner = controlling_mpa_for_pod(pod, mpas)?;
    mpas.iter()
        .position(|m| Arc::ptr_eq(&m.mpa, &winner.mpa))
}

/// Published (cpu millicores, replicas) pair from the status, when present
fn published_policy(mpa: &MultidimPodAutoscaler) -> Option<(i64, i64)> {
    let resources = mpa.status.as_ref()?.recommendation_resources.as_ref()?;
    let cpu = resources
        .container_recommendations
        .first()
        .and_then(|c| c.target.get("cpu"))
        .and_then(|q| parse_milli(q).ok())?;
    Some((cpu, resources.target_pod_num as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpa_common::crd::MultidimPodAutoscalerSpec;

    fn mpa_with_status(cpu: &str, replicas: i32) -> MultidimPodAutoscaler {
        let mut mpa = MultidimPodAutoscaler::new(
            "web-mpa",
            MultidimPodAutoscalerSpec {
                target_ref: None,
                update_policy: None,
                resource_policy: None,
            },
        );
        mpa.status = Some(MultidimPodAutoscalerStatus {
            recommendation_resources: Some(RecommendedResources {
                target_pod_num: replicas,
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: WILDCARD_CONTAINER.into(),
                    target: [(
                        "cpu".to_string(),
                        k8s_openapi::apimachinery::pkg::api::resource::Quantity(cpu.into()),
                    )]
                    .into_iter()
                    .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            conditions: vec![],
        });
        mpa
    }

    #[test]
    fn published_policy_reads_cpu_and_replicas() {
        let mpa = mpa_with_status("1500m", 4);
        assert_eq!(published_policy(&mpa), Some((1500, 4)));
    }

    #[test]
    fn published_policy_handles_whole_core_notation() {
        let mpa = mpa_with_status("2", 3);
        assert_eq!(published_policy(&mpa), Some((2000, 3)));
    }

    #[test]
    fn missing_status_means_no_published_policy() {
        let mpa = MultidimPodAutoscaler::new(
            "fresh",
            MultidimPodAutoscalerSpec {
                target_ref: None,
                update_policy: None,
                resource_policy: None,
            },
        );
        assert!(published_policy(&mpa).is_none());
    }

    /// Running the engine twice over the same inputs must produce the same
    /// decision, so repeated ticks without load changes settle on Skipped.
    #[test]
    fn identical_inputs_skip_on_the_second_pass() {
        let first = engine::recommend(120.0, DEFAULT_RESPONSE_TIME_MS);
        assert!(first.score > 0.0);
        let old_score = engine::score_policy(
            first.cpu_milli,
            first.replicas,
            120.0,
            DEFAULT_RESPONSE_TIME_MS,
        );
        let second = engine::recommend(120.0, DEFAULT_RESPONSE_TIME_MS);
        assert!(!engine::should_publish(second.score, old_score));
    }
}
