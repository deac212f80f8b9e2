//! Watch-backed local stores
//!
//! Every long-lived component reads cluster state from reflector stores
//! rather than listing the API server on each tick. A store is spawned
//! once at startup; the constructor returns only after the initial sync so
//! reads never observe an empty half-filled cache.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{LimitRange, Pod, ReplicationController};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::crd::MultidimPodAutoscaler;
use crate::error::Error;

/// Spawn a reflector for `api` and wait for its initial sync
pub async fn run_store<K>(api: Api<K>, config: watcher::Config) -> Result<Store<K>, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    let (store, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, config));
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream.default_backoff().touched_objects());
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                warn!(error = %e, "watch stream error");
            }
        }
    });
    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::internal_with_context("store", e.to_string()))?;
    Ok(store)
}

/// Read-only cache of MultidimPodAutoscaler objects
#[derive(Clone)]
pub struct MpaStore {
    store: Store<MultidimPodAutoscaler>,
}

impl MpaStore {
    /// Start watching MPAs in `namespace` (all namespaces when `None`) and
    /// wait for the initial sync
    pub async fn run(client: Client, namespace: Option<&str>) -> Result<Self, Error> {
        let api: Api<MultidimPodAutoscaler> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let store = run_store(api, watcher::Config::default()).await?;
        tracing::info!("initial MPA sync complete");
        Ok(Self { store })
    }

    /// All cached autoscalers
    pub fn state(&self) -> Vec<Arc<MultidimPodAutoscaler>> {
        self.store.state()
    }

    /// Cached autoscalers of one namespace
    pub fn in_namespace(&self, namespace: &str) -> Vec<Arc<MultidimPodAutoscaler>> {
        self.store
            .state()
            .into_iter()
            .filter(|mpa| mpa.metadata.namespace.as_deref() == Some(namespace))
            .collect()
    }
}

/// Read-only cache of non-terminal pods
#[derive(Clone)]
pub struct PodStore {
    store: Store<Pod>,
}

impl PodStore {
    /// Start watching pods, excluding terminal phases at the watch itself
    pub async fn run(client: Client, namespace: Option<&str>) -> Result<Self, Error> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        // Succeeded/Failed pods never rejoin a workload; unscheduled pods
        // stay visible and are handled by the Pending eviction rules
        let config =
            watcher::Config::default().fields("status.phase!=Succeeded,status.phase!=Failed");
        let store = run_store(api, config).await?;
        tracing::info!("initial pod sync complete");
        Ok(Self { store })
    }

    /// Cached pods that are not already being deleted
    pub fn living(&self) -> Vec<Arc<Pod>> {
        self.store
            .state()
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .collect()
    }
}

/// Read-only cache of LimitRange objects
#[derive(Clone)]
pub struct LimitRangeStore {
    store: Store<LimitRange>,
}

impl LimitRangeStore {
    /// Start watching LimitRanges and wait for the initial sync
    pub async fn run(client: Client) -> Result<Self, Error> {
        let api: Api<LimitRange> = Api::all(client);
        let store = run_store(api, watcher::Config::default()).await?;
        Ok(Self { store })
    }

    /// Cached LimitRanges of one namespace
    pub fn in_namespace(&self, namespace: &str) -> Vec<Arc<LimitRange>> {
        self.store
            .state()
            .into_iter()
            .filter(|lr| lr.metadata.namespace.as_deref() == Some(namespace))
            .collect()
    }
}

/// Stores for the well-known controller kinds the target fetcher and the
/// eviction coordinator resolve against
#[derive(Clone)]
pub struct KindStores {
    /// apps/v1 Deployments
    pub deployments: Store<Deployment>,
    /// apps/v1 ReplicaSets
    pub replica_sets: Store<ReplicaSet>,
    /// apps/v1 StatefulSets
    pub stateful_sets: Store<StatefulSet>,
    /// apps/v1 DaemonSets
    pub daemon_sets: Store<DaemonSet>,
    /// core/v1 ReplicationControllers
    pub replication_controllers: Store<ReplicationController>,
    /// batch/v1 Jobs
    pub jobs: Store<Job>,
    /// batch/v1 CronJobs
    pub cron_jobs: Store<CronJob>,
}

impl KindStores {
    /// Start one reflector per kind and wait for every initial sync
    pub async fn run(client: Client) -> Result<Self, Error> {
        let stores = Self {
            deployments: run_store(Api::all(client.clone()), watcher::Config::default()).await?,
            replica_sets: run_store(Api::all(client.clone()), watcher::Config::default()).await?,
            stateful_sets: run_store(Api::all(client.clone()), watcher::Config::default()).await?,
            daemon_sets: run_store(Api::all(client.clone()), watcher::Config::default()).await?,
            replication_controllers: run_store(Api::all(client.clone()), watcher::Config::default())
                .await?,
            jobs: run_store(Api::all(client.clone()), watcher::Config::default()).await?,
            cron_jobs: run_store(Api::all(client), watcher::Config::default()).await?,
        };
        tracing::info!("initial controller-kind sync complete");
        Ok(stores)
    }
}

/// Look up a namespaced object in a store by `namespace/name`
pub fn store_get<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<Arc<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    store.get(&ObjectRef::<K>::new(name).within(namespace))
}
