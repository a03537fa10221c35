//! Per-node image inventory, fed by the reporter endpoint.
//!
//! A node's report always carries its full inventory, so ingesting a report
//! replaces the node's set: previously known images are reset and only the
//! reported ones are marked available again. The map lives in memory only
//! and is rebuilt from the next round of reports after a restart.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct NodeRefs {
    refs: Mutex<HashMap<String, HashMap<String, bool>>>,
}

impl NodeRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory for a node.
    pub fn add_images(&self, node: &str, images: &[String]) {
        let mut refs = self.refs.lock().expect("node refs poisoned");
        let entry = refs.entry(node.to_string()).or_default();

        for available in entry.values_mut() {
            *available = false;
        }
        for image in images {
            entry.insert(image.clone(), true);
        }
    }

    /// Whether the node most recently reported the image as present.
    pub fn has_image(&self, node: &str, image: &str) -> bool {
        let refs = self.refs.lock().expect("node refs poisoned");
        refs.get(node)
            .and_then(|images| images.get(image))
            .copied()
            .unwrap_or(false)
    }

    /// Nodes that have reported at least once.
    pub fn nodes(&self) -> Vec<String> {
        let refs = self.refs.lock().expect("node refs poisoned");
        let mut nodes: Vec<String> = refs.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Images currently marked available on a node.
    pub fn available_images(&self, node: &str) -> Vec<String> {
        let refs = self.refs.lock().expect("node refs poisoned");
        let Some(images) = refs.get(node) else {
            return Vec::new();
        };

        let mut available: Vec<String> = images
            .iter()
            .filter(|(_, present)| **present)
            .map(|(image, _)| image.clone())
            .collect();
        available.sort();
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLANG: &str = "docker.io/library/golang:latest";
    const NGINX: &str = "docker.io/library/nginx:latest";

    #[test]
    fn test_add_and_query() {
        let refs = NodeRefs::new();
        refs.add_images("node1", &[GOLANG.to_string(), NGINX.to_string()]);

        assert!(refs.has_image("node1", GOLANG));
        assert!(refs.has_image("node1", NGINX));
        assert!(!refs.has_image("node1", "docker.io/library/redis:latest"));
        assert!(!refs.has_image("node2", GOLANG));
        assert_eq!(refs.nodes(), vec!["node1".to_string()]);
    }

    #[test]
    fn test_report_replaces_inventory() {
        let refs = NodeRefs::new();
        refs.add_images("node1", &[GOLANG.to_string(), NGINX.to_string()]);

        // The next report no longer contains golang.
        refs.add_images("node1", &[NGINX.to_string()]);

        assert!(!refs.has_image("node1", GOLANG));
        assert!(refs.has_image("node1", NGINX));
        assert_eq!(refs.available_images("node1"), vec![NGINX.to_string()]);
    }

    #[test]
    fn test_empty_report_clears_node() {
        let refs = NodeRefs::new();
        refs.add_images("node1", &[GOLANG.to_string()]);
        refs.add_images("node1", &[]);

        assert!(!refs.has_image("node1", GOLANG));
        assert!(refs.available_images("node1").is_empty());
        // The node itself remains known.
        assert_eq!(refs.nodes(), vec!["node1".to_string()]);
    }
}
