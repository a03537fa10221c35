//! In-process object store with watch semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use lagoon_api::{ImageSync, Node, Secret};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{Cluster, ClusterError};

/// Change notification for an ImageSync object. Consumers re-read the
/// object; the event only carries its identity.
#[derive(Debug, Clone)]
pub struct ImageSyncEvent {
    pub namespace: String,
    pub name: String,
}

#[derive(Default)]
struct Inner {
    revision: u64,
    image_syncs: BTreeMap<String, ImageSync>,
    nodes: BTreeMap<String, Node>,
    secrets: BTreeMap<String, Secret>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// The authoritative store embedded in the controller.
pub struct MemoryCluster {
    inner: RwLock<Inner>,
    tx: broadcast::Sender<ImageSyncEvent>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner::default()),
            tx,
        }
    }

    /// Subscribe to ImageSync change events. Slow consumers may observe a
    /// lagged receiver and should re-list.
    pub fn subscribe(&self) -> broadcast::Receiver<ImageSyncEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, namespace: &str, name: &str) {
        let _ = self.tx.send(ImageSyncEvent {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    /// Create a new ImageSync. Assigns a uid when the caller left it empty.
    pub async fn create_image_sync(&self, mut sync: ImageSync) -> Result<ImageSync, ClusterError> {
        if sync.name.is_empty() || sync.namespace.is_empty() {
            return Err(ClusterError::Invalid(
                "imagesync requires namespace and name".to_string(),
            ));
        }

        let stored = {
            let mut inner = self.inner.write().await;
            let k = key(&sync.namespace, &sync.name);
            if inner.image_syncs.contains_key(&k) {
                return Err(ClusterError::AlreadyExists(k));
            }

            if sync.uid.is_empty() {
                sync.uid = uuid::Uuid::new_v4().to_string();
            }
            sync.generation = 1;
            sync.resource_version = inner.next_revision();
            inner.image_syncs.insert(k, sync.clone());
            sync
        };

        self.emit(&stored.namespace, &stored.name);
        Ok(stored)
    }

    /// Write an ImageSync back. Bumps the generation when the spec changed
    /// and drops the object entirely when it is deleting and its last
    /// finalizer was removed.
    pub async fn update_image_sync(&self, mut sync: ImageSync) -> Result<ImageSync, ClusterError> {
        let stored = {
            let mut inner = self.inner.write().await;
            let k = key(&sync.namespace, &sync.name);
            let current = inner
                .image_syncs
                .get(&k)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(k.clone()))?;

            if current.resource_version != sync.resource_version {
                return Err(ClusterError::Conflict(k));
            }

            if sync.is_deleting() && sync.finalizers.is_empty() {
                inner.image_syncs.remove(&k);
                let rev = inner.next_revision();
                debug!(key = %k, revision = rev, "imagesync removed from store");
                sync
            } else {
                if current.spec != sync.spec {
                    sync.generation = current.generation + 1;
                }
                sync.resource_version = inner.next_revision();
                inner.image_syncs.insert(k, sync.clone());
                sync
            }
        };

        self.emit(&stored.namespace, &stored.name);
        Ok(stored)
    }

    /// Write only the status sub-resource.
    pub async fn update_image_sync_status(
        &self,
        sync: ImageSync,
    ) -> Result<ImageSync, ClusterError> {
        let stored = {
            let mut inner = self.inner.write().await;
            let k = key(&sync.namespace, &sync.name);
            let current = inner
                .image_syncs
                .get(&k)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(k.clone()))?;

            if current.resource_version != sync.resource_version {
                return Err(ClusterError::Conflict(k));
            }

            let mut updated = current;
            updated.status = sync.status;
            updated.resource_version = inner.next_revision();
            inner.image_syncs.insert(k, updated.clone());
            updated
        };

        self.emit(&stored.namespace, &stored.name);
        Ok(stored)
    }

    /// Request deletion. With finalizers present this only stamps the
    /// deletion timestamp so agents can observe it.
    pub async fn delete_image_sync(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        {
            let mut inner = self.inner.write().await;
            let k = key(namespace, name);
            let current = inner
                .image_syncs
                .get(&k)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(k.clone()))?;

            if current.finalizers.is_empty() {
                inner.image_syncs.remove(&k);
            } else if current.deletion_timestamp.is_none() {
                let mut updated = current;
                updated.deletion_timestamp = Some(Utc::now());
                updated.resource_version = inner.next_revision();
                inner.image_syncs.insert(k, updated);
            }
        }

        self.emit(namespace, name);
        Ok(())
    }

    pub async fn create_secret(&self, secret: Secret) -> Result<(), ClusterError> {
        let mut inner = self.inner.write().await;
        let k = key(&secret.namespace, &secret.name);
        inner.secrets.insert(k, secret);
        Ok(())
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.inner
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn register_node(&self, node: Node) -> Result<Node, ClusterError> {
        if node.name.is_empty() {
            return Err(ClusterError::Invalid("node requires a name".to_string()));
        }

        let mut inner = self.inner.write().await;
        let rev = inner.next_revision();
        let stored = match inner.nodes.get(&node.name) {
            Some(existing) => {
                // Re-registration refreshes conditions but never clobbers
                // labels projected while the agent was away.
                let mut updated = existing.clone();
                updated.conditions = node.conditions;
                updated.resource_version = rev;
                updated
            }
            None => {
                let mut fresh = node;
                fresh.resource_version = rev;
                fresh
            }
        };

        inner.nodes.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_node(&self, mut node: Node) -> Result<Node, ClusterError> {
        let mut inner = self.inner.write().await;
        let current = inner
            .nodes
            .get(&node.name)
            .ok_or_else(|| ClusterError::NotFound(node.name.clone()))?;

        if current.resource_version != node.resource_version {
            return Err(ClusterError::Conflict(node.name.clone()));
        }

        node.resource_version = inner.next_revision();
        inner.nodes.insert(node.name.clone(), node.clone());
        Ok(node)
    }

    async fn list_image_syncs(&self) -> Result<Vec<ImageSync>, ClusterError> {
        Ok(self.inner.read().await.image_syncs.values().cloned().collect())
    }

    async fn get_image_sync(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ImageSync, ClusterError> {
        let k = key(namespace, name);
        self.inner
            .read()
            .await
            .image_syncs
            .get(&k)
            .cloned()
            .ok_or(ClusterError::NotFound(k))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        let k = key(namespace, name);
        self.inner
            .read()
            .await
            .secrets
            .get(&k)
            .cloned()
            .ok_or(ClusterError::NotFound(k))
    }
}

#[cfg(test)]
mod tests {
    use lagoon_api::{ImageSyncSpec, IMAGE_SYNC_FINALIZER};

    use super::*;

    fn sync(name: &str) -> ImageSync {
        ImageSync {
            namespace: "default".to_string(),
            name: name.to_string(),
            spec: ImageSyncSpec {
                images: vec!["golang:latest".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_uid_and_revision() {
        let cluster = MemoryCluster::new();
        let created = cluster.create_image_sync(sync("example")).await.unwrap();

        assert!(!created.uid.is_empty());
        assert_eq!(created.generation, 1);
        assert!(created.resource_version > 0);

        let err = cluster.create_image_sync(sync("example")).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_conflicts_on_stale_revision() {
        let cluster = MemoryCluster::new();
        let created = cluster.create_image_sync(sync("example")).await.unwrap();

        let mut stale = created.clone();
        stale.resource_version = created.resource_version + 7;
        let err = cluster.update_image_sync(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_spec_change_bumps_generation() {
        let cluster = MemoryCluster::new();
        let mut created = cluster.create_image_sync(sync("example")).await.unwrap();

        created.spec.images.push("nginx:latest".to_string());
        let updated = cluster.update_image_sync(created).await.unwrap();
        assert_eq!(updated.generation, 2);

        // A no-op write keeps the generation.
        let updated = cluster.update_image_sync(updated.clone()).await.unwrap();
        assert_eq!(updated.generation, 2);
    }

    #[tokio::test]
    async fn test_finalizer_deletion_flow() {
        let cluster = MemoryCluster::new();
        let mut created = cluster.create_image_sync(sync("example")).await.unwrap();
        created.finalizers.push(IMAGE_SYNC_FINALIZER.to_string());
        let stored = cluster.update_image_sync(created).await.unwrap();

        // Deletion with a finalizer present only stamps the timestamp.
        cluster.delete_image_sync("default", "example").await.unwrap();
        let mut deleting = cluster.get_image_sync("default", "example").await.unwrap();
        assert!(deleting.is_deleting());

        // Removing the finalizer drops the object.
        deleting.finalizers.clear();
        cluster.update_image_sync(deleting).await.unwrap();
        let err = cluster.get_image_sync("default", "example").await.unwrap_err();
        assert!(err.is_not_found());

        let _ = stored;
    }

    #[tokio::test]
    async fn test_node_register_preserves_labels() {
        let cluster = MemoryCluster::new();
        let node = Node {
            name: "node1".to_string(),
            conditions: Node::ready_conditions(),
            ..Default::default()
        };
        let mut stored = cluster.register_node(node.clone()).await.unwrap();

        stored
            .labels
            .insert("imagesync.lagoon.dev/abc".to_string(), "present".to_string());
        let stored = cluster.update_node(stored).await.unwrap();

        // Agent restart re-registers; projected labels must survive.
        let refreshed = cluster.register_node(node).await.unwrap();
        assert!(refreshed.labels.contains_key("imagesync.lagoon.dev/abc"));
        assert!(refreshed.resource_version > stored.resource_version);
    }

    #[tokio::test]
    async fn test_node_update_conflict() {
        let cluster = MemoryCluster::new();
        let node = Node {
            name: "node1".to_string(),
            conditions: Node::ready_conditions(),
            ..Default::default()
        };
        let stored = cluster.register_node(node).await.unwrap();

        let mut stale = stored.clone();
        stale.resource_version = stored.resource_version + 1;
        let err = cluster.update_node(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let cluster = MemoryCluster::new();
        let mut events = cluster.subscribe();

        cluster.create_image_sync(sync("example")).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.namespace, "default");
        assert_eq!(event.name, "example");
    }
}
