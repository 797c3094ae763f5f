mod config;
mod job;
mod reconcile;
mod status;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Context, Controller};
use kube::Client;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = config::Args::parse();
    let client = Client::try_default().await?;

    let (download_api, job_api) = match &args.namespace {
        Some(namespace) => (
            Api::<types::Download>::namespaced(client.clone(), namespace),
            Api::<Job>::namespaced(client.clone(), namespace),
        ),
        None => (
            Api::<types::Download>::all(client.clone()),
            Api::<Job>::all(client.clone()),
        ),
    };

    tracing::info!(
        namespace = args.namespace.as_deref().unwrap_or("all"),
        image = %args.worker_image,
        "starting download controller"
    );

    let store = Arc::new(store::KubeStore::new(client));

    Controller::new(download_api, ListParams::default())
        .owns(job_api, ListParams::default())
        .shutdown_on_signal()
        .run(
            reconcile::reconcile,
            reconcile::error_policy,
            Context::new(reconcile::Data::new(store, args.settings())),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        })
        .await;

    tracing::info!("controller terminated");

    Ok(())
}
