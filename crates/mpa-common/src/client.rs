//! Kubernetes client construction
//!
//! Builds a client from an explicit kubeconfig path (out-of-cluster runs)
//! or the in-cluster environment.

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

use crate::error::Error;

/// Create a kube client from an optional kubeconfig path.
///
/// The advertised API QPS/burst settings are logged for operators; request
/// pacing itself is left to the API server's priority-and-fairness layer.
pub async fn create_client(
    kubeconfig: Option<&Path>,
    kube_api_qps: f32,
    kube_api_burst: u32,
) -> Result<Client, Error> {
    info!(
        qps = kube_api_qps,
        burst = kube_api_burst,
        "configuring Kubernetes client"
    );
    match kubeconfig {
        Some(path) => {
            info!(path = %path.display(), "using kubeconfig file");
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context("client", format!("failed to read kubeconfig: {e}"))
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "client",
                        format!("failed to load kubeconfig: {e}"),
                    )
                })?;
            Client::try_from(config).map_err(Error::from)
        }
        None => Client::try_default().await.map_err(Error::from),
    }
}
