//! # lagoon-cluster
//!
//! Access to the Kubernetes-style object store.
//!
//! The [`Cluster`] trait is the agent's complete view of the store: read
//! nodes, ImageSyncs, and pull secrets; register and label-patch its own
//! node. Two implementations:
//!
//! - [`MemoryCluster`]: the authoritative in-process store embedded in the
//!   controller (and used directly by tests). Writes bump a global revision,
//!   node and ImageSync updates enforce resource-version optimistic
//!   concurrency, and ImageSync changes fan out on a broadcast channel.
//! - [`HttpCluster`]: the agent-side client speaking to the controller's
//!   REST surface.
//!
//! Deletion follows the two-phase finalizer protocol: while an ImageSync
//! carries finalizers, deletion only stamps `deletion_timestamp`; the object
//! leaves the store when its last finalizer is removed.

mod http;
mod memory;

use async_trait::async_trait;
use lagoon_api::{ImageSync, Node, Secret};
use thiserror::Error;

pub use http::HttpCluster;
pub use memory::{ImageSyncEvent, MemoryCluster};

/// Store access errors, distinguishable by the caller.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Creation of an object that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The store rejected the object.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Transport failure talking to the store.
    #[error("transport: {0}")]
    Transport(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// The agent's view of the object store.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// Create the node object, or refresh its conditions when it already
    /// exists. Labels on an existing node are preserved.
    async fn register_node(&self, node: Node) -> Result<Node, ClusterError>;

    /// Write the node back; fails with [`ClusterError::Conflict`] when the
    /// stored resource version has moved on.
    async fn update_node(&self, node: Node) -> Result<Node, ClusterError>;

    /// All ImageSyncs across namespaces.
    async fn list_image_syncs(&self) -> Result<Vec<ImageSync>, ClusterError>;

    async fn get_image_sync(&self, namespace: &str, name: &str)
        -> Result<ImageSync, ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;
}
