//! Updater binary: enacts recommendations on running workloads

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mpa_common::client::create_client;
use mpa_common::events::KubeEventPublisher;
use mpa_common::stores::{KindStores, MpaStore, PodStore};
use mpa_common::target::{DiscoveryCache, TargetSelectorFetcher};
use mpa_updater::eviction::{EvictionConfig, KubeEvictionApi};
use mpa_updater::priority::IdentityPriority;
use mpa_updater::Updater;

/// Multidimensional pod autoscaler: updater
#[derive(Parser, Debug)]
#[command(name = "mpa-updater", version, about, long_about = None)]
struct Cli {
    /// How often the update loop runs
    #[arg(long, default_value = "60s", value_parser = humantime_duration)]
    updater_interval: Duration,

    /// Smallest replica group eligible for disruption
    #[arg(long, default_value_t = 1)]
    min_replicas: usize,

    /// Fraction of configured replicas evictable in one tick
    #[arg(long, default_value_t = 0.5)]
    eviction_fraction: f64,

    /// Address the Prometheus metrics endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8945")]
    address: SocketAddr,

    /// Path to a kubeconfig; in-cluster configuration when unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Advertised sustained API request rate
    #[arg(long, default_value_t = 5.0)]
    kube_api_qps: f32,

    /// Advertised API request burst
    #[arg(long, default_value_t = 10)]
    kube_api_burst: u32,

    /// Namespace to watch for MPA objects; all namespaces when unset
    #[arg(long)]
    mpa_object_namespace: Option<String>,
}

fn humantime_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Some(secs) = value.strip_suffix('s') {
        return secs
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| e.to_string());
    }
    if let Some(mins) = value.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|e| e.to_string());
    }
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::info!(
        interval = ?cli.updater_interval,
        min_replicas = cli.min_replicas,
        eviction_fraction = cli.eviction_fraction,
        "MPA updater starting"
    );

    mpa_common::metrics::serve_metrics(cli.address);

    let client = create_client(
        cli.kubeconfig.as_deref(),
        cli.kube_api_qps,
        cli.kube_api_burst,
    )
    .await?;

    mpa_common::crd::install_crd(&client).await?;

    let namespace = cli.mpa_object_namespace.as_deref();
    let mpas = MpaStore::run(client.clone(), namespace).await?;
    let pods = PodStore::run(client.clone(), namespace).await?;
    let kinds = KindStores::run(client.clone()).await?;
    let discovery = DiscoveryCache::run(client.clone()).await?;
    let fetcher = TargetSelectorFetcher::new(client.clone(), kinds.clone(), discovery.clone());
    let eviction_api = KubeEvictionApi::new(client.clone());
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "mpa-updater"));

    let updater = Updater::new(
        client,
        mpas,
        pods,
        kinds,
        discovery,
        fetcher,
        eviction_api,
        events,
        Box::new(IdentityPriority),
        EvictionConfig {
            min_replicas_to_update: cli.min_replicas,
            eviction_fraction: cli.eviction_fraction,
        },
    );

    tokio::select! {
        _ = updater.run(cli.updater_interval) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parser_accepts_common_forms() {
        assert_eq!(humantime_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(humantime_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(humantime_duration("later").is_err());
    }
}
