//! Status aggregator.
//!
//! A single ticker that cross-references every ImageSync with the nodes its
//! selector admits and the inventories those nodes last reported. Per image
//! it counts the matched nodes that have the image; the overall condition
//! is the minimum across images, so `available` is the number of nodes on
//! which *every* declared image is present. The status is only patched when
//! something other than the timestamp changed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lagoon_api::{
    matches, ImageSync, ImageSyncCondition, ImageSyncImage, Node,
};
use lagoon_cluster::{Cluster, ClusterError, MemoryCluster};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::noderef::NodeRefs;

/// Default aggregation interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct Aggregator {
    cluster: Arc<MemoryCluster>,
    node_refs: Arc<NodeRefs>,
    tick_interval: Duration,
}

impl Aggregator {
    pub fn new(
        cluster: Arc<MemoryCluster>,
        node_refs: Arc<NodeRefs>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            node_refs,
            tick_interval,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.tick_interval.as_secs(),
            "starting status aggregator"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "aggregation tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("status aggregator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One aggregation pass. Per-object failures are logged and the tick
    /// continues with the remaining objects.
    pub async fn tick(&self) -> Result<(), ClusterError> {
        let syncs = self.cluster.list_image_syncs().await?;
        if syncs.is_empty() {
            return Ok(());
        }

        let nodes = self.cluster.list_nodes().await;

        for sync in syncs {
            if let Err(err) = self.aggregate(&sync, &nodes).await {
                warn!(key = %sync.key(), error = %err, "status aggregation failed");
            }
        }

        Ok(())
    }

    async fn aggregate(&self, sync: &ImageSync, nodes: &[Node]) -> Result<(), ClusterError> {
        let matched: Vec<&Node> = nodes
            .iter()
            .filter(|node| matches(&sync.spec.selector, &node.labels))
            .collect();
        let total_nodes = matched.len() as u32;

        let mut status = sync.status.clone();
        status.total_nodes = total_nodes;
        status.total_images = sync.spec.images.len() as u32;

        if matched.is_empty() {
            status.images = Vec::new();
            status.condition = ImageSyncCondition {
                available: 0,
                pending: 0,
            };
        } else {
            let mut images = Vec::with_capacity(sync.spec.images.len());
            let mut min_available = total_nodes;

            for mut entry in self.image_entries(sync) {
                let available = matched
                    .iter()
                    .filter(|node| self.node_refs.has_image(&node.name, &entry.image))
                    .count() as u32;

                entry.available = available;
                entry.pending = total_nodes - available;
                min_available = min_available.min(available);
                images.push(entry);
            }

            status.images = images;
            status.condition = ImageSyncCondition {
                available: min_available,
                pending: total_nodes - min_available,
            };
        }

        if status.same_as(&sync.status) {
            return Ok(());
        }

        debug!(
            key = %sync.key(),
            nodes = total_nodes,
            available = status.condition.available,
            pending = status.condition.pending,
            "patching imagesync status"
        );

        status.last_updated = Some(Utc::now());
        let mut updated = sync.clone();
        updated.status = status;
        self.cluster.update_image_sync_status(updated).await?;
        Ok(())
    }

    /// The frozen per-image entries when they still line up with the spec,
    /// otherwise fresh canonicalisations (the processor will re-freeze).
    fn image_entries(&self, sync: &ImageSync) -> Vec<ImageSyncImage> {
        let frozen_matches_spec = sync.status.images.len() == sync.spec.images.len()
            && sync
                .status
                .images
                .iter()
                .zip(sync.spec.images.iter())
                .all(|(entry, image)| &entry.name == image);

        if frozen_matches_spec {
            sync.status.images.clone()
        } else {
            sync.spec
                .images
                .iter()
                .map(|image| ImageSyncImage::from_spec_image(image))
                .collect()
        }
    }
}
