//! State observation for a single reconcile.
//!
//! Every reconcile starts from a consistent snapshot of the node, the
//! ImageSync, and its pull secrets. Observation failures carry distinct
//! error kinds so the reconciler can pick the right branch.

use lagoon_api::{matches, ImageSync, Node, Secret};
use lagoon_cluster::Cluster;
use tracing::warn;

use crate::error::AgentError;

/// Snapshot consumed by the reconcile that requested it.
#[derive(Debug, Clone)]
pub struct ObservedState {
    pub image_sync: ImageSync,
    pub node: Node,
    pub pull_secrets: Vec<Secret>,
}

pub struct StateObserver<'a> {
    pub cluster: &'a dyn Cluster,
    pub node_name: &'a str,
}

impl StateObserver<'_> {
    /// Observe the state for one ImageSync.
    ///
    /// Error mapping: a missing or unhealthy node is terminal for the
    /// reconcile; a missing ImageSync means the object was deleted; a
    /// selector mismatch returns [`AgentError::NodeMatch`] carrying the
    /// object so the caller can release any claims it still holds.
    pub async fn observe(&self, namespace: &str, name: &str) -> Result<ObservedState, AgentError> {
        let node = match self.cluster.get_node(self.node_name).await {
            Ok(node) => node,
            Err(err) if err.is_not_found() => return Err(AgentError::NodeNotFound),
            Err(err) => return Err(err.into()),
        };

        if !node.is_ready() {
            return Err(AgentError::NodeNotReady);
        }

        let mut image_sync = match self.cluster.get_image_sync(namespace, name).await {
            Ok(sync) => sync,
            Err(err) if err.is_not_found() => return Err(AgentError::ImageSyncNotFound),
            Err(err) => return Err(err.into()),
        };
        image_sync.defaulted();

        if !matches(&image_sync.spec.selector, &node.labels) {
            return Err(AgentError::NodeMatch {
                sync: Box::new(image_sync),
            });
        }

        let pull_secrets = self.observe_pull_secrets(&image_sync).await?;

        Ok(ObservedState {
            image_sync,
            node,
            pull_secrets,
        })
    }

    /// Fetch the referenced pull secrets. Individually missing secrets are
    /// logged and skipped; the observation fails only when secrets were
    /// requested and none resolved.
    async fn observe_pull_secrets(&self, sync: &ImageSync) -> Result<Vec<Secret>, AgentError> {
        let mut secrets = Vec::with_capacity(sync.spec.image_pull_secrets.len());

        for reference in &sync.spec.image_pull_secrets {
            match self.cluster.get_secret(&sync.namespace, &reference.name).await {
                Ok(secret) => secrets.push(secret),
                Err(err) if err.is_not_found() => {
                    warn!(
                        namespace = %sync.namespace,
                        secret = %reference.name,
                        "pull secret not found"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !sync.spec.image_pull_secrets.is_empty() && secrets.is_empty() {
            return Err(AgentError::PullSecretsNotFound);
        }

        Ok(secrets)
    }
}
