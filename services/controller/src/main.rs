//! Lagoon controller.
//!
//! Hosts the object store and its REST API, ingests inventory reports from
//! the node agents, processes ImageSync objects (defaults, finalizer,
//! canonicalisation freeze), and aggregates availability onto their status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lagoon_cluster::MemoryCluster;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lagoon_controller::aggregator::Aggregator;
use lagoon_controller::api::{self, AppState};
use lagoon_controller::args::Args;
use lagoon_controller::noderef::NodeRefs;
use lagoon_controller::processor::Processor;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level);

    info!(listen = %args.listen_addr, "starting lagoon controller");

    let cluster = Arc::new(MemoryCluster::new());
    let node_refs = Arc::new(NodeRefs::new());
    let state = AppState {
        cluster: Arc::clone(&cluster),
        node_refs: Arc::clone(&node_refs),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let processor = Processor::new(Arc::clone(&cluster));
    let processor_rx = shutdown_rx.clone();
    let processor_handle = tokio::spawn(async move { processor.run(processor_rx).await });

    let aggregator = Aggregator::new(
        cluster,
        node_refs,
        Duration::from_secs(args.aggregate_interval_secs),
    );
    let aggregator_rx = shutdown_rx.clone();
    let aggregator_handle = tokio::spawn(async move { aggregator.run(aggregator_rx).await });

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(listen = %args.listen_addr, "serving object store and reporter");

    let mut serve_rx = shutdown_rx;
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = serve_rx.changed().await;
        })
        .await
        .context("server error")?;

    let _ = processor_handle.await;
    let _ = aggregator_handle.await;

    info!("lagoon controller stopped");
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
