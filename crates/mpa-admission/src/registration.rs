//! Webhook configuration registration
//!
//! On startup, after a short delay so the webhook Service endpoints can
//! converge, the server upserts its MutatingWebhookConfiguration with
//! server-side apply. The webhook intercepts pod CREATE only and is
//! registered fail-open.

use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::info;

use mpa_common::crd::FIELD_MANAGER;
use mpa_common::error::Error;
use mpa_common::WEBHOOK_CONFIG_NAME;

/// How long to wait before registering, letting service endpoints converge
const REGISTRATION_DELAY: Duration = Duration::from_secs(10);

/// Where the API server reaches the webhook; exactly one variant
pub enum WebhookTarget {
    /// ClusterIP service reference
    Service {
        /// Namespace of the service
        namespace: String,
        /// Name of the service
        name: String,
    },
    /// Explicit URL (out-of-cluster deployments)
    Url(String),
}

/// Upsert the mutating webhook configuration for pod CREATE
pub async fn register_webhook(
    client: &Client,
    target: WebhookTarget,
    ca_bundle: Vec<u8>,
    timeout_seconds: i32,
) -> Result<(), Error> {
    tokio::time::sleep(REGISTRATION_DELAY).await;

    let client_config = match target {
        WebhookTarget::Service { namespace, name } => WebhookClientConfig {
            service: Some(ServiceReference {
                namespace,
                name,
                ..Default::default()
            }),
            ca_bundle: Some(k8s_openapi::ByteString(ca_bundle)),
            url: None,
        },
        WebhookTarget::Url(url) => WebhookClientConfig {
            service: None,
            ca_bundle: Some(k8s_openapi::ByteString(ca_bundle)),
            url: Some(url),
        },
    };

    let config = MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: "mpa.autoscaling.mpa.dev".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Ignore".to_string()),
            timeout_seconds: Some(timeout_seconds),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                ..Default::default()
            }]),
            client_config,
            ..Default::default()
        }]),
    };

    let webhooks: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    webhooks
        .patch(WEBHOOK_CONFIG_NAME, &params, &Patch::Apply(&config))
        .await?;

    info!(name = WEBHOOK_CONFIG_NAME, "mutating webhook registered");
    Ok(())
}
