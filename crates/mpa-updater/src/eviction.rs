//! Per-owner eviction budget
//!
//! Rebuilt on every updater tick. Candidate pods are grouped by their
//! managing controller; each group gets a budget of
//! `floor(configured_replicas * eviction_fraction)` disruptions, with an
//! escape clause guaranteeing progress when the fraction rounds to zero.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::EvictParams;
use kube::{Api, Client};
use tracing::{debug, warn};

use mpa_common::error::Error;
use mpa_common::stores::{store_get, KindStores};

/// Updater knobs governing eviction
#[derive(Clone, Copy, Debug)]
pub struct EvictionConfig {
    /// Groups with fewer observed replicas are never disrupted
    pub min_replicas_to_update: usize,
    /// Fraction of configured replicas evictable in one tick
    pub eviction_fraction: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_replicas_to_update: 1,
            eviction_fraction: 0.5,
        }
    }
}

/// Identity of the controller managing a pod
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    /// Namespace of the controller (same as its pods)
    pub namespace: String,
    /// Controller name
    pub name: String,
    /// Controller kind (ReplicaSet, StatefulSet, ...)
    pub kind: String,
}

/// Replica bookkeeping for one owner within a tick
#[derive(Clone, Copy, Debug, Default)]
struct OwnerState {
    configured: usize,
    pending: usize,
    running: usize,
    evicted: usize,
    evictable: usize,
}

/// Source of the configured replica count for an owner
pub trait ReplicaSource {
    /// `.spec.replicas` of the owner, or an error when the owner is
    /// unknown, missing or unconfigured
    fn configured_replicas(&self, owner: &OwnerKey) -> Result<usize, Error>;
}

impl ReplicaSource for KindStores {
    fn configured_replicas(&self, owner: &OwnerKey) -> Result<usize, Error> {
        let missing = || {
            Error::configuration(format!(
                "{} {}/{} does not exist",
                owner.kind, owner.namespace, owner.name
            ))
        };
        let unconfigured = || {
            Error::configuration(format!(
                "{} {}/{} has no replicas configuration",
                owner.kind, owner.namespace, owner.name
            ))
        };
        let replicas = match owner.kind.as_str() {
            "ReplicaSet" => store_get(&self.replica_sets, &owner.namespace, &owner.name)
                .ok_or_else(missing)?
                .spec
                .as_ref()
                .and_then(|s| s.replicas),
            "ReplicationController" => {
                store_get(&self.replication_controllers, &owner.namespace, &owner.name)
                    .ok_or_else(missing)?
                    .spec
                    .as_ref()
                    .and_then(|s| s.replicas)
            }
            "StatefulSet" => store_get(&self.stateful_sets, &owner.namespace, &owner.name)
                .ok_or_else(missing)?
                .spec
                .as_ref()
                .and_then(|s| s.replicas),
            other => {
                return Err(Error::configuration(format!(
                    "unsupported controller kind {other} for replica lookup"
                )))
            }
        };
        match replicas {
            Some(replicas) if replicas > 0 => Ok(replicas as usize),
            _ => Err(unconfigured()),
        }
    }
}

/// The controller reference of a pod: the ownerReference flagged as the
/// controller. Entries without the flag set are ignored.
pub fn managing_controller(pod: &Pod) -> Option<OwnerKey> {
    let namespace = pod.metadata.namespace.clone()?;
    let mut managing = None;
    for owner_ref in pod.metadata.owner_references.iter().flatten() {
        if owner_ref.controller == Some(true) {
            managing = Some(OwnerKey {
                namespace: namespace.clone(),
                name: owner_ref.name.clone(),
                kind: owner_ref.kind.clone(),
            });
        }
    }
    managing
}

fn pod_id(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn is_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
}

/// Eviction bookkeeping for one tick's candidate pods
pub struct EvictionBudget {
    pod_owner: HashMap<String, OwnerKey>,
    states: HashMap<OwnerKey, OwnerState>,
}

impl EvictionBudget {
    /// Group the candidates by owner and size each group's budget
    pub fn new(pods: &[Arc<Pod>], replicas: &impl ReplicaSource, config: &EvictionConfig) -> Self {
        let mut owner_pods: HashMap<OwnerKey, Vec<&Arc<Pod>>> = HashMap::new();
        for pod in pods {
            match managing_controller(pod) {
                Some(owner) => owner_pods.entry(owner).or_default().push(pod),
                None => {
                    debug!(pod = %pod_id(pod), "no managing controller, pod never evictable");
                }
            }
        }

        let mut pod_owner = HashMap::new();
        let mut states = HashMap::new();

        for (owner, pods) in owner_pods {
            let observed = pods.len();
            if observed < config.min_replicas_to_update {
                debug!(
                    owner = %format!("{}/{}", owner.namespace, owner.name),
                    observed,
                    "too few replicas to disrupt"
                );
                continue;
            }

            let configured = if owner.kind == "Job" {
                observed
            } else {
                match replicas.configured_replicas(&owner) {
                    Ok(configured) => configured,
                    Err(e) => {
                        warn!(
                            owner = %format!("{}/{}", owner.namespace, owner.name),
                            kind = %owner.kind,
                            error = %e,
                            "cannot determine configured replicas, skipping group"
                        );
                        continue;
                    }
                }
            };

            let mut state = OwnerState {
                configured,
                evictable: (configured as f64 * config.eviction_fraction) as usize,
                ..Default::default()
            };
            for pod in &pods {
                pod_owner.insert(pod_id(pod), owner.clone());
                if is_pending(pod) {
                    state.pending += 1;
                }
            }
            state.running = observed - state.pending;
            states.insert(owner, state);
        }

        Self { pod_owner, states }
    }

    /// Whether evicting this pod keeps its owner above the disruption floor
    pub fn evictable(&self, pod: &Pod) -> bool {
        let Some(owner) = self.pod_owner.get(&pod_id(pod)) else {
            return false;
        };

        // Pending pods are not serving; replacing them costs nothing
        if is_pending(pod) {
            return true;
        }

        let Some(state) = self.states.get(owner) else {
            return false;
        };
        let floor = state.configured - state.evictable.min(state.configured);
        if state.running - state.evicted.min(state.running) > floor {
            return true;
        }
        // Escape clause: a fully running group whose fraction rounded the
        // budget to zero still gets exactly one eviction
        state.running == state.configured && state.evictable == 0 && state.evicted == 0
    }

    /// Record a successful eviction; pending pods don't consume budget
    pub fn note_evicted(&mut self, pod: &Pod) {
        if is_pending(pod) {
            return;
        }
        if let Some(owner) = self.pod_owner.get(&pod_id(pod)) {
            if let Some(state) = self.states.get_mut(owner) {
                state.evicted += 1;
            }
        }
    }
}

/// The cluster-side eviction call, mockable in tests
#[async_trait]
pub trait EvictionApi: Send + Sync {
    /// Evict one pod through the eviction subresource
    async fn evict(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Production eviction through `policy/v1` on the pod API
pub struct KubeEvictionApi {
    client: Client,
}

impl KubeEvictionApi {
    /// Build over the shared client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EvictionApi for KubeEvictionApi {
    async fn evict(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.evict(name, &EvictParams::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    struct FixedReplicas(HashMap<OwnerKey, usize>);

    impl ReplicaSource for FixedReplicas {
        fn configured_replicas(&self, owner: &OwnerKey) -> Result<usize, Error> {
            self.0
                .get(owner)
                .copied()
                .ok_or_else(|| Error::configuration("unknown owner"))
        }
    }

    fn owner(name: &str) -> OwnerKey {
        OwnerKey {
            namespace: "default".into(),
            name: name.into(),
            kind: "ReplicaSet".into(),
        }
    }

    fn pod(name: &str, owner_name: Option<&str>, phase: &str) -> Arc<Pod> {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.into());
        pod.metadata.namespace = Some("default".into());
        if let Some(owner_name) = owner_name {
            pod.metadata.owner_references = Some(vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: owner_name.into(),
                controller: Some(true),
                ..Default::default()
            }]);
        }
        pod.status = Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        });
        Arc::new(pod)
    }

    fn config(min: usize, fraction: f64) -> EvictionConfig {
        EvictionConfig {
            min_replicas_to_update: min,
            eviction_fraction: fraction,
        }
    }

    /// Story: 10 configured replicas with fraction 0.3 allow exactly 3
    /// disruptions; the fourth request is refused.
    #[test]
    fn story_budget_caps_disruption() {
        let pods: Vec<_> = (0..10)
            .map(|i| pod(&format!("web-{i}"), Some("web"), "Running"))
            .collect();
        let source = FixedReplicas(HashMap::from([(owner("web"), 10)]));
        let mut budget = EvictionBudget::new(&pods, &source, &config(1, 0.3));

        for pod in pods.iter().take(3) {
            assert!(budget.evictable(pod), "{:?}", pod.metadata.name);
            budget.note_evicted(pod);
        }
        assert!(!budget.evictable(&pods[3]));
    }

    /// Story: fraction 0 with every pod running still allows exactly one
    /// eviction through the escape clause, then stops.
    #[test]
    fn story_escape_clause_guarantees_progress() {
        let pods: Vec<_> = (0..4)
            .map(|i| pod(&format!("web-{i}"), Some("web"), "Running"))
            .collect();
        let source = FixedReplicas(HashMap::from([(owner("web"), 4)]));
        let mut budget = EvictionBudget::new(&pods, &source, &config(1, 0.0));

        assert!(budget.evictable(&pods[0]));
        budget.note_evicted(&pods[0]);
        assert!(!budget.evictable(&pods[1]));
    }

    #[test]
    fn pending_pods_are_always_evictable_and_free() {
        let pods = vec![
            pod("web-0", Some("web"), "Running"),
            pod("web-1", Some("web"), "Pending"),
            pod("web-2", Some("web"), "Running"),
            pod("web-3", Some("web"), "Running"),
        ];
        let source = FixedReplicas(HashMap::from([(owner("web"), 4)]));
        let mut budget = EvictionBudget::new(&pods, &source, &config(1, 0.5));

        // Budget is floor(4 * 0.5) = 2, three pods are running. Evicting
        // the pending pod consumes nothing; one running pod can follow
        // before the running count hits the floor.
        assert!(budget.evictable(&pods[1]));
        budget.note_evicted(&pods[1]);
        assert!(budget.evictable(&pods[0]));
        budget.note_evicted(&pods[0]);
        assert!(!budget.evictable(&pods[2]));
    }

    #[test]
    fn unknown_owner_is_never_evictable() {
        let pods = vec![pod("stray", None, "Running")];
        let source = FixedReplicas(HashMap::new());
        let budget = EvictionBudget::new(&pods, &source, &config(1, 1.0));
        assert!(!budget.evictable(&pods[0]));
    }

    #[test]
    fn small_groups_are_left_alone() {
        let pods = vec![pod("web-0", Some("web"), "Running")];
        let source = FixedReplicas(HashMap::from([(owner("web"), 1)]));
        let budget = EvictionBudget::new(&pods, &source, &config(2, 1.0));
        assert!(!budget.evictable(&pods[0]));
    }

    #[test]
    fn replica_lookup_failure_skips_the_group() {
        let pods = vec![
            pod("web-0", Some("web"), "Running"),
            pod("web-1", Some("web"), "Running"),
        ];
        let source = FixedReplicas(HashMap::new());
        let budget = EvictionBudget::new(&pods, &source, &config(1, 1.0));
        assert!(!budget.evictable(&pods[0]));
    }

    #[test]
    fn job_groups_use_the_observed_count() {
        let mut pods = Vec::new();
        for i in 0..3 {
            let mut p = Pod::default();
            p.metadata.name = Some(format!("work-{i}"));
            p.metadata.namespace = Some("default".into());
            p.metadata.owner_references = Some(vec![OwnerReference {
                api_version: "batch/v1".into(),
                kind: "Job".into(),
                name: "work".into(),
                controller: Some(true),
                ..Default::default()
            }]);
            p.status = Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            });
            pods.push(Arc::new(p));
        }
        // No replica source entry needed for Jobs
        let source = FixedReplicas(HashMap::new());
        let mut budget = EvictionBudget::new(&pods, &source, &config(1, 0.34));

        // floor(3 * 0.34) = 1 eviction allowed
        assert!(budget.evictable(&pods[0]));
        budget.note_evicted(&pods[0]);
        assert!(!budget.evictable(&pods[1]));
    }

    #[test]
    fn owner_refs_without_controller_flag_are_ignored() {
        let mut p = Pod::default();
        p.metadata.name = Some("orphan".into());
        p.metadata.namespace = Some("default".into());
        p.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "web".into(),
            controller: None,
            ..Default::default()
        }]);
        assert!(managing_controller(&p).is_none());
    }

    #[test]
    fn last_controller_reference_wins() {
        let mut p = Pod::default();
        p.metadata.name = Some("web-0".into());
        p.metadata.namespace = Some("default".into());
        p.metadata.owner_references = Some(vec![
            OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "old".into(),
                controller: Some(true),
                ..Default::default()
            },
            OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "new".into(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        assert_eq!(managing_controller(&p).unwrap().name, "new");
    }
}
