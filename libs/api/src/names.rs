//! Canonical image names and label hashing.

use md5::{Digest, Md5};

use crate::types::IMAGE_SYNC_LABEL_PREFIX;

/// Default search registry for short image references.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Expand an image reference to its fully qualified form.
///
/// - `foo` becomes `docker.io/library/foo:latest`
/// - `a/b` becomes `docker.io/a/b:latest` unless the first path component
///   looks like a hostname (contains `.` or `:`) or is `localhost`
/// - a reference without a tag after the final `/` gains `:latest`
///
/// The expansion is idempotent: applying it to an already qualified name
/// returns the name unchanged.
pub fn qualified_name(image: &str) -> String {
    let mut name = image.to_string();

    let parts: Vec<&str> = image.splitn(2, '/').collect();
    if parts.len() == 1 {
        name = format!("{DEFAULT_REGISTRY}/library/{image}");
    } else if !(parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost") {
        name = format!("{DEFAULT_REGISTRY}/{image}");
    }

    // Only the segment after the last '/' can carry a tag, so a ':' in a
    // registry port does not suppress the default tag.
    let tail = name.rsplit('/').next().unwrap_or(name.as_str());
    if !tail.contains(':') {
        name.push_str(":latest");
    }

    name
}

/// The node-label value for an image: the hex MD5 of its canonical name.
pub fn label_value(fqn: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(fqn.as_bytes());
    hex::encode(hasher.finalize())
}

/// The full node-label key for an image.
pub fn label_key(fqn: &str) -> String {
    format!("{}/{}", IMAGE_SYNC_LABEL_PREFIX, label_value(fqn))
}

/// The registry host component of a qualified image name.
pub fn registry_host(fqn: &str) -> &str {
    fqn.split('/').next().unwrap_or(DEFAULT_REGISTRY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name_short() {
        assert_eq!(qualified_name("golang"), "docker.io/library/golang:latest");
        assert_eq!(qualified_name("nginx:1.27"), "docker.io/library/nginx:1.27");
    }

    #[test]
    fn test_qualified_name_user_repo() {
        assert_eq!(qualified_name("myuser/myapp"), "docker.io/myuser/myapp:latest");
        assert_eq!(qualified_name("myuser/myapp:v1"), "docker.io/myuser/myapp:v1");
    }

    #[test]
    fn test_qualified_name_custom_registry() {
        assert_eq!(qualified_name("ghcr.io/org/repo:v2"), "ghcr.io/org/repo:v2");
        assert_eq!(qualified_name("ghcr.io/org/repo"), "ghcr.io/org/repo:latest");
    }

    #[test]
    fn test_qualified_name_localhost_port() {
        assert_eq!(
            qualified_name("localhost:5000/myapp"),
            "localhost:5000/myapp:latest"
        );
        assert_eq!(qualified_name("localhost/myapp"), "localhost/myapp:latest");
    }

    #[test]
    fn test_qualified_name_idempotent() {
        for image in [
            "golang",
            "nginx:latest",
            "myuser/myapp",
            "ghcr.io/org/repo:v2",
            "localhost:5000/myapp",
        ] {
            let once = qualified_name(image);
            assert_eq!(qualified_name(&once), once);
        }
    }

    #[test]
    fn test_label_value() {
        // Stable MD5 so labels survive agent restarts and version skew.
        assert_eq!(
            label_value("docker.io/library/golang:latest"),
            "7f88bbf3e814bc26c05c719c470303da"
        );
    }

    #[test]
    fn test_label_key_prefix() {
        let key = label_key("docker.io/library/nginx:latest");
        assert!(key.starts_with("imagesync.lagoon.dev/"));
        assert_eq!(key.len(), "imagesync.lagoon.dev/".len() + 32);
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("docker.io/library/golang:latest"), "docker.io");
        assert_eq!(registry_host("localhost:5000/myapp:latest"), "localhost:5000");
    }
}
