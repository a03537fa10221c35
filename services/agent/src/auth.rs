//! Registry credential lookup.
//!
//! Pull secrets are consumed as a black box: each carries a docker config
//! JSON payload mapping registry hosts to credentials. The keyring indexes
//! those by host and answers "which credentials might work for this image",
//! in secret order, for the runtime client to try one at a time.

use std::collections::HashMap;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use lagoon_api::{registry_host, Secret, DEFAULT_REGISTRY, DOCKER_CONFIG_JSON_KEY};
use lagoon_proto::cri::AuthConfig;
use serde::Deserialize;
use tracing::warn;

/// Legacy host docker hub credentials are commonly stored under.
const DOCKER_INDEX_HOST: &str = "index.docker.io";

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
    #[serde(default, rename = "identitytoken")]
    identity_token: String,
}

/// Credentials indexed by registry host.
#[derive(Default)]
pub struct Keyring {
    by_host: HashMap<String, Vec<AuthConfig>>,
}

impl Keyring {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a keyring from the observed pull secrets. Malformed payloads
    /// are logged and skipped; a secret without a docker config key simply
    /// contributes nothing.
    pub fn from_secrets(secrets: &[Secret]) -> Self {
        let mut by_host: HashMap<String, Vec<AuthConfig>> = HashMap::new();

        for secret in secrets {
            let Some(encoded) = secret.data.get(DOCKER_CONFIG_JSON_KEY) else {
                continue;
            };

            let raw = match BASE64_STANDARD.decode(encoded) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(
                        namespace = %secret.namespace,
                        secret = %secret.name,
                        error = %err,
                        "pull secret is not valid base64"
                    );
                    continue;
                }
            };

            let config: DockerConfig = match serde_json::from_slice(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!(
                        namespace = %secret.namespace,
                        secret = %secret.name,
                        error = %err,
                        "pull secret is not a docker config"
                    );
                    continue;
                }
            };

            for (registry, entry) in config.auths {
                let host = normalize_host(&registry);
                by_host
                    .entry(host.clone())
                    .or_default()
                    .push(entry.into_auth(&host));
            }
        }

        Self { by_host }
    }

    /// Credentials worth trying for a qualified image name. Empty means
    /// pull anonymously.
    pub fn lookup(&self, fqn: &str) -> Vec<AuthConfig> {
        let host = registry_host(fqn);
        let mut auths = self.by_host.get(host).cloned().unwrap_or_default();

        // Docker hub credentials are frequently keyed by the index host.
        if host == DEFAULT_REGISTRY {
            if let Some(extra) = self.by_host.get(DOCKER_INDEX_HOST) {
                auths.extend(extra.iter().cloned());
            }
        }

        auths
    }
}

impl DockerConfigEntry {
    fn into_auth(self, host: &str) -> AuthConfig {
        let (mut username, mut password) = (self.username, self.password);

        // The combined `auth` field wins when user/password are absent.
        if username.is_empty() && !self.auth.is_empty() {
            if let Ok(decoded) = BASE64_STANDARD.decode(&self.auth) {
                if let Ok(pair) = String::from_utf8(decoded) {
                    if let Some((user, pass)) = pair.split_once(':') {
                        username = user.to_string();
                        password = pass.to_string();
                    }
                }
            }
        }

        AuthConfig {
            username,
            password,
            auth: self.auth,
            server_address: host.to_string(),
            identity_token: self.identity_token,
            registry_token: String::new(),
        }
    }
}

/// Strip scheme and path from a registry key: credentials may be stored
/// under `https://ghcr.io/v1/` style keys.
fn normalize_host(registry: &str) -> String {
    let stripped = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}
