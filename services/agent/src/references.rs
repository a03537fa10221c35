//! Reference collection: which ImageSync resources claim which images.
//!
//! Two flat maps behind one mutex:
//!
//! - `images`: image name -> digest -> live claim count
//! - `refs`: (resource uid, image name) -> the single digest that resource
//!   currently claims
//!
//! The flat representation keeps every operation O(1); there is nothing to
//! walk. The collection is ephemeral: built up as reconciles land, gone on
//! shutdown.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    images: HashMap<String, HashMap<String, u32>>,
    refs: HashMap<(String, String), String>,
}

/// Concurrency-safe claim tracking for the images under management on this
/// node.
#[derive(Default)]
pub struct References {
    inner: Mutex<Inner>,
}

impl References {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim. Re-adding the same digest is a no-op; a different
    /// digest for an existing (uid, name) claim is digest drift: the old
    /// digest's count is decremented before the new one is incremented.
    pub fn add(&self, uid: &str, name: &str, digest: &str) {
        let mut inner = self.inner.lock().expect("references poisoned");
        let key = (uid.to_string(), name.to_string());

        if let Some(existing) = inner.refs.get(&key).cloned() {
            if existing == digest {
                return;
            }
            Self::decrement(&mut inner.images, name, &existing);
        }

        inner.refs.insert(key, digest.to_string());
        *inner
            .images
            .entry(name.to_string())
            .or_default()
            .entry(digest.to_string())
            .or_insert(0) += 1;
    }

    /// Release a claim. Decrements are floored at zero and a digest that no
    /// longer matches is tolerated; the (uid, name) entry is removed either
    /// way.
    pub fn remove(&self, uid: &str, name: &str, digest: &str) {
        let mut inner = self.inner.lock().expect("references poisoned");
        Self::decrement(&mut inner.images, name, digest);
        inner.refs.remove(&(uid.to_string(), name.to_string()));
    }

    /// Current claim count for (name, digest).
    pub fn references(&self, name: &str, digest: &str) -> u32 {
        let inner = self.inner.lock().expect("references poisoned");
        inner
            .images
            .get(name)
            .and_then(|digests| digests.get(digest))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_referenced(&self, name: &str, digest: &str) -> bool {
        self.references(name, digest) > 0
    }

    /// Distinct image names with at least one live claim, sorted so label
    /// projection is deterministic.
    pub fn to_image_list(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("references poisoned");
        let mut names: Vec<String> = inner
            .images
            .iter()
            .filter(|(_, digests)| digests.values().any(|count| *count > 0))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Image names currently claimed by the given resource.
    pub fn image_list_for_uid(&self, uid: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("references poisoned");
        let mut names: Vec<String> = inner
            .refs
            .keys()
            .filter(|(owner, _)| owner == uid)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Whether the resource holds any claim on this node.
    pub fn has_uid(&self, uid: &str) -> bool {
        let inner = self.inner.lock().expect("references poisoned");
        inner.refs.keys().any(|(owner, _)| owner == uid)
    }

    fn decrement(images: &mut HashMap<String, HashMap<String, u32>>, name: &str, digest: &str) {
        let Some(digests) = images.get_mut(name) else {
            return;
        };

        if let Some(count) = digests.get_mut(digest) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                digests.remove(digest);
            }
        }

        if digests.is_empty() {
            images.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID1: &str = "uid-1";
    const UID2: &str = "uid-2";
    const GOLANG: &str = "docker.io/library/golang:latest";
    const NGINX: &str = "docker.io/library/nginx:latest";

    #[test]
    fn test_add_and_remove_roundtrip() {
        let refs = References::new();

        refs.add(UID1, GOLANG, "sha256:g1");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 1);
        assert!(refs.is_referenced(GOLANG, "sha256:g1"));

        refs.remove(UID1, GOLANG, "sha256:g1");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 0);
        assert!(!refs.is_referenced(GOLANG, "sha256:g1"));
        assert!(!refs.has_uid(UID1));
    }

    #[test]
    fn test_add_same_digest_is_idempotent() {
        let refs = References::new();

        refs.add(UID1, GOLANG, "sha256:g1");
        refs.add(UID1, GOLANG, "sha256:g1");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 1);
    }

    #[test]
    fn test_digest_drift_moves_the_count() {
        let refs = References::new();

        refs.add(UID1, GOLANG, "sha256:old");
        refs.add(UID1, GOLANG, "sha256:new");

        assert_eq!(refs.references(GOLANG, "sha256:old"), 0);
        assert_eq!(refs.references(GOLANG, "sha256:new"), 1);
    }

    #[test]
    fn test_shared_image_counts_per_claim() {
        let refs = References::new();

        refs.add(UID1, GOLANG, "sha256:g1");
        refs.add(UID2, GOLANG, "sha256:g1");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 2);

        // One claimant leaving keeps the image under management.
        refs.remove(UID1, GOLANG, "sha256:g1");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 1);
        assert_eq!(refs.to_image_list(), vec![GOLANG.to_string()]);
    }

    #[test]
    fn test_remove_absent_key_is_a_noop() {
        let refs = References::new();

        refs.remove(UID1, GOLANG, "sha256:g1");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 0);

        // Underflow is floored, not wrapped.
        refs.add(UID1, GOLANG, "sha256:g1");
        refs.remove(UID1, GOLANG, "sha256:other");
        assert_eq!(refs.references(GOLANG, "sha256:g1"), 1);
    }

    #[test]
    fn test_image_list_for_uid() {
        let refs = References::new();

        refs.add(UID1, GOLANG, "sha256:g1");
        refs.add(UID1, NGINX, "sha256:n1");
        refs.add(UID2, NGINX, "sha256:n1");

        assert_eq!(
            refs.image_list_for_uid(UID1),
            vec![GOLANG.to_string(), NGINX.to_string()]
        );
        assert_eq!(refs.image_list_for_uid(UID2), vec![NGINX.to_string()]);
        assert!(refs.has_uid(UID1));
        assert!(refs.has_uid(UID2));
        assert!(!refs.has_uid("uid-3"));
    }

    #[test]
    fn test_counts_match_claims_invariant() {
        // For every (name, digest): images count equals the number of refs
        // entries pointing at it.
        let refs = References::new();
        let claims = [
            (UID1, GOLANG, "sha256:g1"),
            (UID2, GOLANG, "sha256:g1"),
            (UID1, NGINX, "sha256:n1"),
        ];
        for (uid, name, digest) in claims {
            refs.add(uid, name, digest);
        }

        for (name, digest) in [(GOLANG, "sha256:g1"), (NGINX, "sha256:n1")] {
            let inner = refs.inner.lock().unwrap();
            let counted = inner
                .refs
                .iter()
                .filter(|((_, n), d)| n == name && d.as_str() == digest)
                .count() as u32;
            assert_eq!(counted, inner.images[name][digest]);
        }
    }
}
