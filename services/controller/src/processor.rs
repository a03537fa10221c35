//! Central ImageSync processor.
//!
//! Watches the store and settles every live ImageSync into its processed
//! shape: defaults applied, the finalizer attached, and the status frozen
//! with one entry per spec image carrying the canonical name and label
//! reference. Freezing happens whenever the content revision drifts, so
//! every downstream consumer reads the same canonicalisation decisions.
//!
//! On deletion the processor removes the finalizer and nothing else: the
//! finalizer exists only to guarantee agents observe a
//! deletion-timestamp-bearing update before the object disappears.

use std::sync::Arc;

use lagoon_api::{ImageSyncImage, IMAGE_SYNC_FINALIZER};
use lagoon_cluster::{Cluster, ClusterError, MemoryCluster};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Processor {
    cluster: Arc<MemoryCluster>,
}

impl Processor {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.cluster.subscribe();

        // Settle anything created before we subscribed.
        if let Err(err) = self.process_all().await {
            warn!(error = %err, "initial imagesync pass failed");
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(err) = self.process(&event.namespace, &event.name).await {
                            warn!(
                                namespace = %event.namespace,
                                name = %event.name,
                                error = %err,
                                "imagesync processing failed"
                            );
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "event stream lagged, re-listing");
                        if let Err(err) = self.process_all().await {
                            warn!(error = %err, "imagesync re-list failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("imagesync processor shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn process_all(&self) -> Result<(), ClusterError> {
        for sync in self.cluster.list_image_syncs().await? {
            if let Err(err) = self.process(&sync.namespace, &sync.name).await {
                warn!(key = %sync.key(), error = %err, "imagesync processing failed");
            }
        }
        Ok(())
    }

    pub async fn process(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut sync = match self.cluster.get_image_sync(namespace, name).await {
            Ok(sync) => sync,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        sync.defaulted();

        if sync.is_deleting() {
            if sync.finalizers.iter().any(|f| f == IMAGE_SYNC_FINALIZER) {
                debug!(namespace, name, "removing finalizer");
                sync.finalizers.retain(|f| f != IMAGE_SYNC_FINALIZER);
                match self.cluster.update_image_sync(sync).await {
                    Ok(_) => {}
                    // A racing write wins; the next event retries.
                    Err(err) if err.is_conflict() => {}
                    Err(err) => return Err(err),
                }
            }
            return Ok(());
        }

        if !sync.finalizers.iter().any(|f| f == IMAGE_SYNC_FINALIZER) {
            sync.finalizers.push(IMAGE_SYNC_FINALIZER.to_string());
            sync = match self.cluster.update_image_sync(sync).await {
                Ok(updated) => updated,
                Err(err) if err.is_conflict() => return Ok(()),
                Err(err) => return Err(err),
            };
        }

        if sync.has_changed() {
            info!(
                namespace,
                name,
                images = sync.spec.images.len(),
                "freezing imagesync canonicalisation"
            );

            let mut status = sync.status.clone();
            status.images = sync
                .spec
                .images
                .iter()
                .map(|image| ImageSyncImage::from_spec_image(image))
                .collect();
            status.total_images = sync.spec.images.len() as u32;
            status.revision = sync.revision_hash();

            sync.status = status;
            match self.cluster.update_image_sync_status(sync).await {
                Ok(_) => {}
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lagoon_api::{ImageSync, ImageSyncSpec};

    use super::*;

    fn sync(images: &[&str]) -> ImageSync {
        ImageSync {
            namespace: "default".to_string(),
            name: "example".to_string(),
            spec: ImageSyncSpec {
                images: images.iter().map(|image| image.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_process_freezes_status() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.create_image_sync(sync(&["golang", "nginx:1.27"])).await.unwrap();

        let processor = Processor::new(cluster.clone());
        processor.process("default", "example").await.unwrap();

        let stored = cluster.get_image_sync("default", "example").await.unwrap();
        assert!(stored.is_processed());
        assert!(!stored.has_changed());
        assert!(stored.finalizers.contains(&IMAGE_SYNC_FINALIZER.to_string()));
        assert_eq!(stored.status.total_images, 2);
        assert_eq!(stored.status.images.len(), 2);
        assert_eq!(stored.status.images[0].name, "golang");
        assert_eq!(
            stored.status.images[0].image,
            "docker.io/library/golang:latest"
        );
        assert_eq!(stored.status.images[0].reference.len(), 32);
    }

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.create_image_sync(sync(&["golang"])).await.unwrap();

        let processor = Processor::new(cluster.clone());
        processor.process("default", "example").await.unwrap();
        let first = cluster.get_image_sync("default", "example").await.unwrap();

        processor.process("default", "example").await.unwrap();
        let second = cluster.get_image_sync("default", "example").await.unwrap();
        assert_eq!(first.resource_version, second.resource_version);
    }

    #[tokio::test]
    async fn test_spec_change_refreezes() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.create_image_sync(sync(&["golang"])).await.unwrap();

        let processor = Processor::new(cluster.clone());
        processor.process("default", "example").await.unwrap();

        let mut stored = cluster.get_image_sync("default", "example").await.unwrap();
        let old_revision = stored.status.revision.clone();
        stored.spec.images.push("nginx:latest".to_string());
        cluster.update_image_sync(stored).await.unwrap();

        processor.process("default", "example").await.unwrap();
        let refrozen = cluster.get_image_sync("default", "example").await.unwrap();
        assert_ne!(refrozen.status.revision, old_revision);
        assert_eq!(refrozen.status.images.len(), 2);
    }

    #[tokio::test]
    async fn test_deletion_removes_finalizer_only() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.create_image_sync(sync(&["golang"])).await.unwrap();

        let processor = Processor::new(cluster.clone());
        processor.process("default", "example").await.unwrap();

        cluster.delete_image_sync("default", "example").await.unwrap();
        processor.process("default", "example").await.unwrap();

        // Finalizer gone means the store dropped the object entirely.
        let err = cluster.get_image_sync("default", "example").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_process_missing_object_is_ok() {
        let cluster = Arc::new(MemoryCluster::new());
        let processor = Processor::new(cluster);
        processor.process("default", "ghost").await.unwrap();
    }
}
