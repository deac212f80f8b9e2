//! Admission binary: TLS webhook server plus registration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mpa_admission::registration::{register_webhook, WebhookTarget};
use mpa_admission::server::{admission_routes, AdmissionState};
use mpa_admission::tls::TlsMaterial;
use mpa_common::client::create_client;
use mpa_common::matcher::Matcher;
use mpa_common::stores::{KindStores, LimitRangeStore, MpaStore};
use mpa_common::target::{DiscoveryCache, TargetSelectorFetcher};

/// Multidimensional pod autoscaler: admission webhook
#[derive(Parser, Debug)]
#[command(name = "mpa-admission", version, about, long_about = None)]
struct Cli {
    /// Path to the CA certificate bundle
    #[arg(long, default_value = "/etc/mpa-tls-certs/caCert.pem")]
    client_ca_file: PathBuf,

    /// Path to the server certificate
    #[arg(long, default_value = "/etc/mpa-tls-certs/serverCert.pem")]
    tls_cert_file: PathBuf,

    /// Path to the server private key
    #[arg(long, default_value = "/etc/mpa-tls-certs/serverKey.pem")]
    tls_private_key: PathBuf,

    /// Port the HTTPS webhook listens on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Address the Prometheus metrics endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8944")]
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

    /// Name of the ClusterIP service fronting this webhook
    #[arg(long, default_value = "mpa-webhook")]
    webhook_service: String,

    /// Explicit webhook URL; replaces the service reference when set
    #[arg(long)]
    webhook_url: Option<String>,

    /// timeoutSeconds on the registered webhook
    #[arg(long, default_value_t = 30)]
    webhook_timeout_seconds: i32,

    /// Namespace to watch for MPA objects; all namespaces when unset
    #[arg(long)]
    mpa_object_namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // One process-wide TLS provider for both the client and the listener
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the default crypto provider");
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::info!(port = cli.port, "MPA admission webhook starting");

    let material = TlsMaterial::load(&cli.client_ca_file, &cli.tls_cert_file, &cli.tls_private_key)?;

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
    let limit_ranges = LimitRangeStore::run(client.clone()).await?;
    let kinds = KindStores::run(client.clone()).await?;
    let discovery = DiscoveryCache::run(client.clone()).await?;
    let fetcher = TargetSelectorFetcher::new(client.clone(), kinds, discovery);

    let state = Arc::new(AdmissionState {
        matcher: Matcher::new(mpas, fetcher),
        limit_ranges,
    });

    // Register in the background: the listener must be up before the
    // API server starts sending reviews
    let target = match cli.webhook_url.clone() {
        Some(url) => WebhookTarget::Url(url),
        None => WebhookTarget::Service {
            namespace: std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            name: cli.webhook_service.clone(),
        },
    };
    let registration_client = client.clone();
    let ca_bundle = material.ca_pem.clone();
    let timeout_seconds = cli.webhook_timeout_seconds;
    tokio::spawn(async move {
        if let Err(e) =
            register_webhook(&registration_client, target, ca_bundle, timeout_seconds).await
        {
            tracing::error!(error = %e, "webhook registration failed");
        }
    });

    let tls_config = RustlsConfig::from_pem(material.cert_pem, material.key_pem)
        .await
        .map_err(|e| anyhow::anyhow!("invalid TLS material: {e}"))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!(addr = %addr, "admission server listening");
    axum_server::bind_rustls(addr, tls_config)
        .serve(admission_routes(state).into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("admission server error: {e}"))?;

    Ok(())
}
