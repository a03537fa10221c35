//! # lagoon-api
//!
//! Resource model shared by the lagoon agent and controller.
//!
//! The types here mirror the wire representation of the objects held by the
//! cluster store: the `ImageSync` resource that declares which images should
//! be pre-pulled where, the `Node` objects the agents project labels onto,
//! and the pull-secret subset of `Secret`. The module also owns the two
//! deterministic derivations everything else hangs off of:
//!
//! - **Canonical image names**: short references are lifted to fully
//!   qualified `host/repo/name:tag` form exactly once, and every consumer
//!   works with the canonical form from then on.
//! - **Label hashing**: the node-label value for an image is the hex MD5 of
//!   its canonical name. The hash condenses an arbitrary reference into a
//!   valid label key segment; it is not a security primitive.

mod names;
mod selector;
mod types;

pub use names::{label_key, label_value, qualified_name, registry_host, DEFAULT_REGISTRY};
pub use selector::{matches, NodeSelector, Operator};
pub use types::{
    ConditionStatus, ImageSync, ImageSyncCondition, ImageSyncImage, ImageSyncSpec, ImageSyncStatus,
    LocalObjectReference, Node, NodeCondition, NodeConditionType, Secret, DOCKER_CONFIG_JSON_KEY,
    IMAGE_SYNC_FINALIZER, IMAGE_SYNC_LABEL_PREFIX,
};
