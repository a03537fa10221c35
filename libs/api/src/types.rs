//! Resource objects held by the cluster store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::names::qualified_name;
use crate::selector::NodeSelector;

/// Prefix for every node label owned by the synchronizer. All other labels
/// on a node are preserved untouched.
pub const IMAGE_SYNC_LABEL_PREFIX: &str = "imagesync.lagoon.dev";

/// Finalizer placed on ImageSync objects by the controller so agents are
/// guaranteed to observe a deletion-timestamp-bearing update before the
/// object disappears from the store.
pub const IMAGE_SYNC_FINALIZER: &str = "imagesync.lagoon.dev/finalizer";

/// Secret data key holding docker registry credentials.
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Declarative resource listing images to be present on a selected subset of
/// nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSync {
    pub uid: String,
    pub namespace: String,
    pub name: String,

    /// Bumped by the store on every spec change.
    #[serde(default)]
    pub generation: i64,

    /// Bumped by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    pub spec: ImageSyncSpec,

    #[serde(default)]
    pub status: ImageSyncStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSyncSpec {
    /// Images to fetch.
    pub images: Vec<String>,

    /// Which nodes the images should be synced to. Empty matches all nodes.
    #[serde(default)]
    pub selector: Vec<NodeSelector>,

    /// Secrets to use when pulling the images.
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSyncStatus {
    /// Number of nodes matching the selector.
    #[serde(default)]
    pub total_nodes: u32,

    /// Number of images managed by the object.
    #[serde(default)]
    pub total_images: u32,

    /// Overall availability: the minimum across all images.
    #[serde(default)]
    pub condition: ImageSyncCondition,

    /// Per-image state, with canonicalisation frozen by the controller.
    #[serde(default)]
    pub images: Vec<ImageSyncImage>,

    /// Content hash of the identifying fields and the image list; agents
    /// treat an object without a revision as not yet processed.
    #[serde(default)]
    pub revision: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Per-image availability as seen by the status aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSyncImage {
    /// The image reference as written in the spec.
    pub name: String,

    /// The fully qualified image name.
    pub image: String,

    /// The node-label value for the image (hex MD5 of the qualified name).
    pub reference: String,

    #[serde(default)]
    pub available: u32,

    #[serde(default)]
    pub pending: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSyncCondition {
    pub available: u32,
    pub pending: u32,
}

impl ImageSync {
    /// `namespace/name` key used by work queues and caches.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether the controller has populated the status; agents ignore
    /// unprocessed objects since their canonicalisation is not yet frozen.
    pub fn is_processed(&self) -> bool {
        !self.status.revision.is_empty()
    }

    /// Content hash over the identifying fields and the image list.
    ///
    /// serde_json sorts object keys, so the serialization is canonical.
    pub fn revision_hash(&self) -> String {
        let canonical = serde_json::json!({
            "namespace": self.namespace,
            "name": self.name,
            "uid": self.uid,
            "images": self.spec.images,
        })
        .to_string();

        let mut hasher = Md5::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn has_changed(&self) -> bool {
        self.status.revision != self.revision_hash()
    }

    /// Normalize optional spec fields. Defaulting is applied after every
    /// read so downstream code never sees missing collections.
    pub fn defaulted(&mut self) {
        // The serde defaults already produce empty collections; nothing
        // further to normalize today. Kept as the single defaulting hook.
    }
}

impl ImageSyncStatus {
    /// Deep equality ignoring the `last_updated` timestamp, used by the
    /// aggregator to decide whether a patch is necessary.
    pub fn same_as(&self, other: &ImageSyncStatus) -> bool {
        self.total_nodes == other.total_nodes
            && self.total_images == other.total_images
            && self.condition == other.condition
            && self.images == other.images
            && self.revision == other.revision
    }
}

/// Worker node, as read and label-patched by the agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    #[serde(default)]
    pub resource_version: u64,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: NodeConditionType,
    pub status: ConditionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeConditionType {
    Ready,
    MemoryPressure,
    DiskPressure,
    PIDPressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Node {
    /// A node is eligible for image syncing when it is ready and reports
    /// neither disk nor PID pressure. Missing conditions count against the
    /// node.
    pub fn is_ready(&self) -> bool {
        let mut ready = false;
        let mut no_disk_pressure = false;
        let mut no_pid_pressure = false;

        for condition in &self.conditions {
            match condition.kind {
                NodeConditionType::Ready => ready = condition.status == ConditionStatus::True,
                NodeConditionType::DiskPressure => {
                    no_disk_pressure = condition.status == ConditionStatus::False;
                }
                NodeConditionType::PIDPressure => {
                    no_pid_pressure = condition.status == ConditionStatus::False;
                }
                NodeConditionType::MemoryPressure => {}
            }
        }

        ready && no_disk_pressure && no_pid_pressure
    }

    /// Standard conditions for a healthy node; used by agents registering
    /// themselves and by tests.
    pub fn ready_conditions() -> Vec<NodeCondition> {
        vec![
            NodeCondition {
                kind: NodeConditionType::Ready,
                status: ConditionStatus::True,
            },
            NodeCondition {
                kind: NodeConditionType::MemoryPressure,
                status: ConditionStatus::False,
            },
            NodeCondition {
                kind: NodeConditionType::DiskPressure,
                status: ConditionStatus::False,
            },
            NodeCondition {
                kind: NodeConditionType::PIDPressure,
                status: ConditionStatus::False,
            },
        ]
    }
}

/// The pull-secret subset of a Secret: named, namespaced, base64 payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub name: String,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ImageSyncImage {
    /// Build the frozen per-image entry for a spec reference.
    pub fn from_spec_image(name: &str) -> Self {
        let image = qualified_name(name);
        let reference = crate::names::label_value(&image);
        Self {
            name: name.to_string(),
            image,
            reference,
            available: 0,
            pending: 0,
        }
    }
}
