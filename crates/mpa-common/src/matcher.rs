//! Pod-to-autoscaler matching
//!
//! A pod is controlled by at most one autoscaler: the candidates are the
//! autoscalers of the pod's namespace whose fetched selector matches the
//! pod's labels, and ties are broken deterministically by (earlier
//! creation timestamp, then lexicographically smaller name).

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::crd::{MultidimPodAutoscaler, UpdateMode};
use crate::selector::PodSelector;
use crate::stores::MpaStore;
use crate::target::SelectorFetch;

/// An autoscaler paired with its resolved pod selector
#[derive(Clone)]
pub struct MpaWithSelector {
    /// The autoscaler object
    pub mpa: Arc<MultidimPodAutoscaler>,
    /// Selector fetched from the autoscaler's target
    pub selector: PodSelector,
}

/// Whether `mws` controls `pod`: same namespace and matching labels
pub fn pod_matches_mpa(pod: &Pod, mws: &MpaWithSelector) -> bool {
    if pod.metadata.namespace != mws.mpa.metadata.namespace {
        return false;
    }
    let empty = BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
    mws.selector.matches(labels)
}

/// Resolve the single controlling autoscaler for a pod out of a candidate
/// list, or `None` when nothing matches
pub fn controlling_mpa_for_pod<'a>(
    pod: &Pod,
    mpas: &'a [MpaWithSelector],
) -> Option<&'a MpaWithSelector> {
    let mut controlling: Option<&MpaWithSelector> = None;
    for candidate in mpas {
        if pod_matches_mpa(pod, candidate)
            && stronger(&candidate.mpa, controlling.map(|c| c.mpa.as_ref()))
        {
            controlling = Some(candidate);
        }
    }
    controlling
}

/// Priority between two autoscalers claiming the same pod:
/// earlier creation wins, then the lexicographically smaller name
fn stronger(a: &MultidimPodAutoscaler, b: Option<&MultidimPodAutoscaler>) -> bool {
    let Some(b) = b else { return true };
    let a_time = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let b_time = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
    if a_time != b_time {
        // `None` sorts first, mirroring an unset (zero) creation timestamp
        return a_time < b_time;
    }
    a.metadata.name < b.metadata.name
}

/// Request-scoped matcher used by the admission path: one pod at a time,
/// selectors fetched on demand
pub struct Matcher<F> {
    mpas: MpaStore,
    fetcher: F,
}

impl<F: SelectorFetch> Matcher<F> {
    /// Build a matcher over the MPA store and a selector fetcher
    pub fn new(mpas: MpaStore, fetcher: F) -> Self {
        Self { mpas, fetcher }
    }

    /// Find the autoscaler controlling `pod`, ignoring `updateMode=Off`
    pub async fn matching_mpa(&self, pod: &Pod) -> Option<Arc<MultidimPodAutoscaler>> {
        let namespace = pod.metadata.namespace.as_deref()?;

        let mut candidates = Vec::new();
        for mpa in self.mpas.in_namespace(namespace) {
            if mpa.update_mode() == UpdateMode::Off {
                continue;
            }
            match self.fetcher.fetch(&mpa).await {
                Ok(selector) => candidates.push(MpaWithSelector { mpa, selector }),
                Err(e) => {
                    debug!(mpa = %mpa.id(), error = %e, "cannot fetch selector, skipping");
                }
            }
        }

        controlling_mpa_for_pod(pod, &candidates).map(|m| m.mpa.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MultidimPodAutoscalerSpec, TargetRef};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn mpa(name: &str, namespace: &str, created_secs: i64) -> Arc<MultidimPodAutoscaler> {
        let mut mpa = MultidimPodAutoscaler::new(
            name,
            MultidimPodAutoscalerSpec {
                target_ref: Some(TargetRef {
                    api_version: Some("apps/v1".into()),
                    kind: "Deployment".into(),
                    name: name.into(),
                }),
                update_policy: None,
                resource_policy: None,
            },
        );
        mpa.metadata.namespace = Some(namespace.into());
        mpa.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
        Arc::new(mpa)
    }

    fn with_selector(mpa: Arc<MultidimPodAutoscaler>, selector: &str) -> MpaWithSelector {
        MpaWithSelector {
            mpa,
            selector: PodSelector::parse(selector).unwrap(),
        }
    }

    fn pod(namespace: &str, labels: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("pod-1".into());
        pod.metadata.namespace = Some(namespace.into());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod
    }

    #[test]
    fn matching_requires_same_namespace() {
        let candidates = vec![with_selector(mpa("a", "other", 0), "app=web")];
        assert!(controlling_mpa_for_pod(&pod("default", &[("app", "web")]), &candidates).is_none());
    }

    #[test]
    fn matching_requires_selector_match() {
        let candidates = vec![with_selector(mpa("a", "default", 0), "app=db")];
        assert!(controlling_mpa_for_pod(&pod("default", &[("app", "web")]), &candidates).is_none());
    }

    /// Story: two autoscalers claim the same pod; the older object wins.
    #[test]
    fn earlier_creation_wins_the_tie() {
        let candidates = vec![
            with_selector(mpa("b-newer", "default", 100), "app=web"),
            with_selector(mpa("a-older", "default", 99), "app=web"),
        ];
        let winner =
            controlling_mpa_for_pod(&pod("default", &[("app", "web")]), &candidates).unwrap();
        assert_eq!(winner.mpa.metadata.name.as_deref(), Some("a-older"));
    }

    /// Story: identical creation timestamps fall back to name ordering so
    /// the result stays deterministic.
    #[test]
    fn equal_timestamps_fall_back_to_name_order() {
        let candidates = vec![
            with_selector(mpa("zeta", "default", 50), "app=web"),
            with_selector(mpa("alpha", "default", 50), "app=web"),
        ];
        let winner =
            controlling_mpa_for_pod(&pod("default", &[("app", "web")]), &candidates).unwrap();
        assert_eq!(winner.mpa.metadata.name.as_deref(), Some("alpha"));
    }

    #[test]
    fn winner_actually_matches_the_pod() {
        let candidates = vec![
            with_selector(mpa("a", "default", 1), "app=db"),
            with_selector(mpa("b", "default", 2), "app=web"),
        ];
        let p = pod("default", &[("app", "web")]);
        let winner = controlling_mpa_for_pod(&p, &candidates).unwrap();
        assert_eq!(winner.mpa.metadata.name.as_deref(), Some("b"));
        assert!(pod_matches_mpa(&p, winner));
    }

    #[test]
    fn pod_without_labels_only_matches_empty_selector() {
        let p = pod("default", &[]);
        let strict = vec![with_selector(mpa("a", "default", 0), "app=web")];
        assert!(controlling_mpa_for_pod(&p, &strict).is_none());

        let open = vec![with_selector(mpa("a", "default", 0), "")];
        assert!(controlling_mpa_for_pod(&p, &open).is_some());
    }
}
