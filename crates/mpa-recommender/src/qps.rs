//! Per-pod QPS from the custom metrics API
//!
//! The recommender reads the `http_requests` metric for every pod matched
//! by an autoscaler's selector through
//! `custom.metrics.k8s.io/v1beta1`. There is no typed client for that API
//! group, so the wire types are declared here and fetched with a raw
//! request on the shared client.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Client;
use serde::Deserialize;

use mpa_common::error::Error;
use mpa_common::quantity::parse_milli;
use mpa_common::selector::PodSelector;
use mpa_common::QPS_METRIC_NAME;

/// `namespace/name` identity of a pod carrying a metric sample
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodId {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

/// Metric milli-value per pod
pub type PodQpsMap = HashMap<PodId, i64>;

/// Object a metric sample describes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribedObject {
    #[serde(default)]
    namespace: String,
    name: String,
}

/// One sample from the custom metrics API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricValue {
    described_object: DescribedObject,
    value: Quantity,
}

/// Response envelope of a custom-metrics list
#[derive(Debug, Deserialize)]
struct MetricValueList {
    #[serde(default)]
    items: Vec<MetricValue>,
}

/// Source of per-pod QPS samples
#[async_trait]
pub trait QpsProvider: Send + Sync {
    /// Metric milli-values for the pods matching `selector` in `namespace`
    async fn pod_qps(&self, namespace: &str, selector: &PodSelector) -> Result<PodQpsMap, Error>;
}

/// Production provider backed by the aggregated custom metrics API
pub struct CustomMetricsClient {
    client: Client,
}

impl CustomMetricsClient {
    /// Build a provider over the shared client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QpsProvider for CustomMetricsClient {
    async fn pod_qps(&self, namespace: &str, selector: &PodSelector) -> Result<PodQpsMap, Error> {
        let path = format!(
            "/apis/custom.metrics.k8s.io/v1beta1/namespaces/{}/pods/*/{}?labelSelector={}",
            namespace,
            QPS_METRIC_NAME,
            urlencode(&selector.to_string()),
        );
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("metrics", e.to_string()))?;

        let list: MetricValueList = self.client.request(request).await?;
        if list.items.is_empty() {
            return Err(Error::missing_metric(namespace, selector.to_string()));
        }

        let mut qps = PodQpsMap::with_capacity(list.items.len());
        for item in list.items {
            let milli = parse_milli(&item.value)?;
            let namespace = if item.described_object.namespace.is_empty() {
                namespace.to_string()
            } else {
                item.described_object.namespace
            };
            qps.insert(
                PodId {
                    namespace,
                    name: item.described_object.name,
                },
                milli,
            );
        }
        Ok(qps)
    }
}

/// Percent-encode the selector for use as a query parameter
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
