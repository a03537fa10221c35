//! Lagoon node agent.
//!
//! Runs on every worker node. Watches ImageSync objects, keeps the declared
//! images pulled through the local container runtime, projects availability
//! labels onto the node, and reports the image inventory to the controller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lagoon_cluster::{Cluster, HttpCluster};
use lagoon_reconcile::{Backoff, WorkQueue};
use tokio::sync::{watch, Semaphore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lagoon_agent::args::Args;
use lagoon_agent::informer::{Dispatcher, Informer};
use lagoon_agent::reconciler::Reconciler;
use lagoon_agent::references::References;
use lagoon_agent::reporter::Reporter;
use lagoon_agent::runtime::{CriImages, RuntimeClient};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level);

    info!(
        node = %args.node_name,
        controller = %args.controller_url,
        runtime = %args.runtime_addr,
        "starting lagoon agent"
    );

    let ca = load_ca(args.tls_dir.as_deref())?;
    let cluster: Arc<dyn Cluster> = Arc::new(HttpCluster::new(
        &args.controller_url,
        ca.clone(),
        args.insecure_skip_verify,
    )?);

    // The store has no kubelet; the agent announces its own node.
    let node = lagoon_api::Node {
        name: args.node_name.clone(),
        conditions: lagoon_api::Node::ready_conditions(),
        ..Default::default()
    };
    cluster
        .register_node(node)
        .await
        .context("failed to register node")?;

    let cri = CriImages::connect(&args.runtime_addr)
        .await
        .context("failed to connect to container runtime")?;
    let runtime = Arc::new(RuntimeClient::new(Box::new(cri)));

    let references = Arc::new(References::new());
    let pullers = Arc::new(Semaphore::new(args.max_concurrent_pullers));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&cluster),
        Arc::clone(&runtime),
        Arc::clone(&references),
        pullers,
        &args.node_name,
    ));

    let queue = WorkQueue::new(Backoff::requeue());
    let informer = Informer::new(
        Arc::clone(&cluster),
        Arc::clone(&queue),
        Duration::from_secs(args.resync_interval_secs),
    );
    let dispatcher = Dispatcher::new(queue, reconciler, args.max_concurrent_reconcilers);

    let reporter = Reporter::new(
        Arc::clone(&runtime),
        &args.node_name,
        &args.controller_url,
        Duration::from_secs(args.poll_interval_secs),
        ca,
        args.insecure_skip_verify,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let informer_rx = shutdown_rx.clone();
    let informer_handle = tokio::spawn(async move { informer.run(informer_rx).await });

    let dispatcher_rx = shutdown_rx.clone();
    let dispatcher_handle = tokio::spawn(async move { dispatcher.run(dispatcher_rx).await });

    let reporter_handle = tokio::spawn(async move { reporter.run(shutdown_rx).await });

    let _ = informer_handle.await;
    let _ = dispatcher_handle.await;
    let _ = reporter_handle.await;

    info!("lagoon agent stopped");
    Ok(())
}

fn init_tracing(level: u8) {
    let level = match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

fn load_ca(dir: Option<&Path>) -> Result<Option<reqwest::Certificate>> {
    let Some(dir) = dir else {
        return Ok(None);
    };

    let path = dir.join("ca.crt");
    let pem = std::fs::read(&path)
        .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
    let certificate = reqwest::Certificate::from_pem(&pem)
        .with_context(|| format!("invalid CA bundle {}", path.display()))?;
    Ok(Some(certificate))
}
