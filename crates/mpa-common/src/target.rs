//! Target selector resolution
//!
//! An autoscaler names the controller owning its pods through
//! `spec.targetRef`. The pod label selector is resolved from the
//! watch-backed store of a well-known controller kind. For anything else,
//! the fallback queries the scale subresource of every API resource the
//! discovery cache knows under that kind and parses `.status.selector`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::{Api, DynamicObject};
use kube::discovery::{ApiResource, Discovery};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crd::MultidimPodAutoscaler;
use crate::error::Error;
use crate::selector::PodSelector;
use crate::stores::{store_get, KindStores};

/// How often the discovery cache is re-run to pick up new CRDs
pub const DISCOVERY_REFRESH_PERIOD: Duration = Duration::from_secs(300);

/// Resolves the pod selector for an autoscaler's target
#[async_trait]
pub trait SelectorFetch: Send + Sync {
    /// Fetch the selector; `Ok` implies a usable (non-error) selector
    async fn fetch(&self, mpa: &MultidimPodAutoscaler) -> Result<PodSelector, Error>;
}

/// Periodically refreshed view of API discovery
#[derive(Clone)]
pub struct DiscoveryCache {
    inner: Arc<RwLock<Discovery>>,
}

impl DiscoveryCache {
    /// Run discovery once, then keep refreshing it in the background so
    /// newly registered CRDs become resolvable without a restart
    pub async fn run(client: Client) -> Result<Self, Error> {
        let discovery = Discovery::new(client.clone()).run().await?;
        let inner = Arc::new(RwLock::new(discovery));

        let refresh = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DISCOVERY_REFRESH_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                match Discovery::new(client.clone()).run().await {
                    Ok(discovery) => *refresh.write().await = discovery,
                    Err(e) => warn!(error = %e, "discovery refresh failed"),
                }
            }
        });

        Ok(Self { inner })
    }

    /// API resources matching `kind` (and `group` unless empty), candidates
    /// for a scale subresource query
    pub async fn resources_for_kind(&self, group: &str, kind: &str) -> Vec<ApiResource> {
        let discovery = self.inner.read().await;
        let mut out = Vec::new();
        for api_group in discovery.groups() {
            if !group.is_empty() && api_group.name() != group {
                continue;
            }
            for (resource, _capabilities) in api_group.recommended_resources() {
                if resource.kind == kind {
                    out.push(resource);
                }
            }
        }
        out
    }
}

/// Production fetcher: well-known kind stores first, scale subresource as
/// the fallback
pub struct TargetSelectorFetcher {
    client: Client,
    kinds: KindStores,
    discovery: DiscoveryCache,
}

impl TargetSelectorFetcher {
    /// Build a fetcher over already-synced stores and a running discovery
    /// cache
    pub fn new(client: Client, kinds: KindStores, discovery: DiscoveryCache) -> Self {
        Self {
            client,
            kinds,
            discovery,
        }
    }

    fn well_known_selector(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<Result<PodSelector, Error>> {
        let missing =
            || Error::configuration(format!("{kind} {namespace}/{name} does not exist"));
        let no_selector =
            || Error::configuration(format!("{kind} {namespace}/{name} has no selector"));

        match kind {
            "Deployment" => Some(match store_get(&self.kinds.deployments, namespace, name) {
                None => Err(missing()),
                Some(obj) => obj
                    .spec
                    .as_ref()
                    .map(|s| PodSelector::from_label_selector(&s.selector))
                    .unwrap_or_else(|| Err(no_selector())),
            }),
            "ReplicaSet" => Some(match store_get(&self.kinds.replica_sets, namespace, name) {
                None => Err(missing()),
                Some(obj) => obj
                    .spec
                    .as_ref()
                    .map(|s| PodSelector::from_label_selector(&s.selector))
                    .unwrap_or_else(|| Err(no_selector())),
            }),
            "StatefulSet" => Some(match store_get(&self.kinds.stateful_sets, namespace, name) {
                None => Err(missing()),
                Some(obj) => obj
                    .spec
                    .as_ref()
                    .map(|s| PodSelector::from_label_selector(&s.selector))
                    .unwrap_or_else(|| Err(no_selector())),
            }),
            "DaemonSet" => Some(match store_get(&self.kinds.daemon_sets, namespace, name) {
                None => Err(missing()),
                Some(obj) => obj
                    .spec
                    .as_ref()
                    .map(|s| PodSelector::from_label_selector(&s.selector))
                    .unwrap_or_else(|| Err(no_selector())),
            }),
            "ReplicationController" => Some(
                match store_get(&self.kinds.replication_controllers, namespace, name) {
                    None => Err(missing()),
                    Some(obj) => obj
                        .spec
                        .as_ref()
                        .and_then(|s| s.selector.as_ref())
                        .map(|labels| Ok(PodSelector::from_label_map(labels)))
                        .unwrap_or_else(|| Err(no_selector())),
                },
            ),
            "Job" => Some(match store_get(&self.kinds.jobs, namespace, name) {
                None => Err(missing()),
                Some(obj) => obj
                    .spec
                    .as_ref()
                    .and_then(|s| s.selector.as_ref())
                    .map(PodSelector::from_label_selector)
                    .unwrap_or_else(|| Err(no_selector())),
            }),
            "CronJob" => Some(match store_get(&self.kinds.cron_jobs, namespace, name) {
                None => Err(missing()),
                Some(obj) => obj
                    .spec
                    .as_ref()
                    .and_then(|s| s.job_template.spec.as_ref())
                    .and_then(|s| s.template.metadata.as_ref())
                    .and_then(|m| m.labels.as_ref())
                    .map(|labels| Ok(PodSelector::from_label_map(labels)))
                    .unwrap_or_else(|| Err(no_selector())),
            }),
            _ => None,
        }
    }

    /// Fallback path: try the scale subresource of every discovered API
    /// resource carrying the target kind; the first success wins
    async fn selector_from_scale(
        &self,
        mpa_id: &str,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<PodSelector, Error> {
        let group = match api_version.split_once('/') {
            Some((group, _version)) => group,
            None => "",
        };

        let candidates = self.discovery.resources_for_kind(group, kind).await;
        if candidates.is_empty() {
            return Err(Error::configuration_for(
                mpa_id,
                format!("no API resource found for kind {kind}"),
            ));
        }

        let mut last_error: Option<kube::Error> = None;
        for resource in candidates {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &resource);
            match api.get_scale(name).await {
                Ok(scale) => return selector_from_scale_status(namespace, name, &scale),
                Err(e) => {
                    debug!(
                        kind,
                        resource = %resource.plural,
                        error = %e,
                        "scale subresource lookup failed, trying next mapping"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(Error::configuration_for(
            mpa_id,
            format!(
                "unhandled targetRef {api_version} / {kind} / {name}, last error: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        ))
    }
}

/// Parse `.status.selector` off a scale object; an empty selector is an
/// error (it would match every pod in the namespace)
fn selector_from_scale_status(
    namespace: &str,
    name: &str,
    scale: &Scale,
) -> Result<PodSelector, Error> {
    let selector = scale
        .status
        .as_ref()
        .and_then(|s| s.selector.as_deref())
        .unwrap_or_default();
    if selector.is_empty() {
        return Err(Error::configuration(format!(
            "resource {namespace}/{name} has an empty selector for scale subresource"
        )));
    }
    PodSelector::parse(selector)
}

#[async_trait]
impl SelectorFetch for TargetSelectorFetcher {
    async fn fetch(&self, mpa: &MultidimPodAutoscaler) -> Result<PodSelector, Error> {
        let id = mpa.id();
        let namespace = mpa
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::configuration_for(id.clone(), "autoscaler has no namespace"))?;
        let target_ref = mpa
            .spec
            .target_ref
            .as_ref()
            .ok_or_else(|| Error::configuration_for(id.clone(), "targetRef undefined"))?;

        if let Some(result) = self.well_known_selector(&target_ref.kind, namespace, &target_ref.name)
        {
            return result;
        }

        self.selector_from_scale(
            &id,
            target_ref.api_version.as_deref().unwrap_or_default(),
            &target_ref.kind,
            namespace,
            &target_ref.name,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::autoscaling::v1::ScaleStatus;

    #[test]
    fn empty_scale_selector_is_an_error() {
        let scale = Scale {
            status: Some(ScaleStatus {
                replicas: 3,
                selector: Some(String::new()),
            }),
            ..Default::default()
        };
        let err = selector_from_scale_status("default", "web", &scale).unwrap_err();
        assert!(err.to_string().contains("empty selector"));
    }

    #[test]
    fn scale_selector_string_is_parsed() {
        let scale = Scale {
            status: Some(ScaleStatus {
                replicas: 3,
                selector: Some("app=web,tier in (frontend)".into()),
            }),
            ..Default::default()
        };
        let selector = selector_from_scale_status("default", "web", &scale).unwrap();
        let labels = std::collections::BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "frontend".to_string()),
        ]);
        assert!(selector.matches(&labels));
    }

    #[test]
    fn missing_scale_status_is_an_error() {
        let err = selector_from_scale_status("default", "web", &Scale::default()).unwrap_err();
        assert!(err.to_string().contains("empty selector"));
    }
}
