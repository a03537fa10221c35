//! Agent error kinds.

use lagoon_api::ImageSync;
use lagoon_cluster::ClusterError;
use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors surfaced by the observe/reconcile path. Every kind the dispatch
/// loop treats differently is a distinct variant.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent's own node object is missing from the store.
    #[error("node not found")]
    NodeNotFound,

    /// The node is missing readiness conditions or reports pressure.
    #[error("node not ready")]
    NodeNotReady,

    /// The node no longer matches the ImageSync selector. Not an error
    /// semantically: the reconciler switches to the cleanup branch, using
    /// the carried object for its claims.
    #[error("node does not match selector")]
    NodeMatch { sync: Box<ImageSync> },

    /// The ImageSync disappeared from the store; terminal success.
    #[error("imagesync not found")]
    ImageSyncNotFound,

    /// Pull secrets were requested but none resolved.
    #[error("no pull secrets resolved")]
    PullSecretsNotFound,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
