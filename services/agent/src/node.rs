//! Node label projection.
//!
//! The agent owns every node label under the ImageSync prefix and nothing
//! else. Projection is erase-then-write: the full prefixed label set is
//! recomputed from the reference collection on every call, never mutated
//! incrementally. That makes the label set converge even after crashes that
//! left it stale.

use std::sync::Arc;

use lagoon_api::{label_key, IMAGE_SYNC_LABEL_PREFIX};
use lagoon_cluster::Cluster;
use tracing::debug;

use crate::error::AgentError;
use crate::references::References;

/// Value written for every projected image label.
pub const LABEL_PRESENT: &str = "present";

pub struct NodeLabels {
    cluster: Arc<dyn Cluster>,
    node_name: String,
}

impl NodeLabels {
    pub fn new(cluster: Arc<dyn Cluster>, node_name: &str) -> Self {
        Self {
            cluster,
            node_name: node_name.to_string(),
        }
    }

    /// Rewrite the node's ImageSync-prefixed labels from the current
    /// reference collection. A concurrent node write surfaces as a conflict
    /// and the whole reconcile retries.
    pub async fn project(&self, references: &References) -> Result<(), AgentError> {
        let node = self.cluster.get_node(&self.node_name).await;
        let mut node = match node {
            Ok(node) => node,
            Err(err) if err.is_not_found() => return Err(AgentError::NodeNotFound),
            Err(err) => return Err(err.into()),
        };

        let prefix = format!("{IMAGE_SYNC_LABEL_PREFIX}/");
        node.labels.retain(|key, _| !key.starts_with(&prefix));

        let images = references.to_image_list();
        for fqn in &images {
            node.labels.insert(label_key(fqn), LABEL_PRESENT.to_string());
        }

        debug!(
            node = %self.node_name,
            images = images.len(),
            "projecting image labels"
        );

        self.cluster.update_node(node).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lagoon_api::Node;
    use lagoon_cluster::MemoryCluster;

    use super::*;

    async fn cluster_with_node() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::new());
        let mut node = Node {
            name: "node1".to_string(),
            conditions: Node::ready_conditions(),
            ..Default::default()
        };
        node.labels
            .insert("kubernetes.io/hostname".to_string(), "node1".to_string());
        cluster.register_node(node).await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_project_writes_prefixed_labels() {
        let cluster = cluster_with_node().await;
        let references = References::new();
        references.add("uid-1", "docker.io/library/golang:latest", "sha256:g1");

        let projector = NodeLabels::new(cluster.clone(), "node1");
        projector.project(&references).await.unwrap();

        let node = cluster.get_node("node1").await.unwrap();
        let key = label_key("docker.io/library/golang:latest");
        assert_eq!(node.labels.get(&key).map(String::as_str), Some("present"));
        assert!(node.labels.contains_key("kubernetes.io/hostname"));
    }

    #[tokio::test]
    async fn test_project_erases_stale_labels() {
        let cluster = cluster_with_node().await;

        // Simulate a stale label left behind by a crashed agent.
        let mut node = cluster.get_node("node1").await.unwrap();
        node.labels.insert(
            format!("{IMAGE_SYNC_LABEL_PREFIX}/deadbeef"),
            "present".to_string(),
        );
        cluster.update_node(node).await.unwrap();

        let references = References::new();
        let projector = NodeLabels::new(cluster.clone(), "node1");
        projector.project(&references).await.unwrap();

        let node = cluster.get_node("node1").await.unwrap();
        assert!(!node
            .labels
            .keys()
            .any(|key| key.starts_with(IMAGE_SYNC_LABEL_PREFIX)));
        assert!(node.labels.contains_key("kubernetes.io/hostname"));
    }

    #[tokio::test]
    async fn test_project_missing_node() {
        let cluster = Arc::new(MemoryCluster::new());
        let projector = NodeLabels::new(cluster, "ghost");
        let err = projector.project(&References::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::NodeNotFound));
    }
}
