//! HTTP client for the controller's object-store API.

use std::time::Duration;

use async_trait::async_trait;
use lagoon_api::{ImageSync, Node, Secret};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{Cluster, ClusterError};

/// Agent-side store client. One instance per agent process; the underlying
/// reqwest client pools connections.
pub struct HttpCluster {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCluster {
    /// `base_url` is the controller endpoint, e.g. `https://lagoon-controller:8443`.
    /// `ca` adds a trusted root for self-signed deployments;
    /// `insecure_skip_verify` disables certificate verification entirely.
    pub fn new(
        base_url: &str,
        ca: Option<reqwest::Certificate>,
        insecure_skip_verify: bool,
    ) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure_skip_verify);
        if let Some(ca) = ca {
            builder = builder.add_root_certificate(ca);
        }

        Ok(Self {
            client: builder
                .build()
                .map_err(|e| ClusterError::Transport(e.to_string()))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(
        response: Response,
        what: &str,
    ) -> Result<T, ClusterError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ClusterError::Transport(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, body = %body, what, "store request failed");
        Err(match status {
            StatusCode::NOT_FOUND => ClusterError::NotFound(what.to_string()),
            StatusCode::CONFLICT => ClusterError::Conflict(what.to_string()),
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
                ClusterError::Invalid(body)
            }
            _ => ClusterError::Transport(format!("{what}: {status}: {body}")),
        })
    }
}

#[async_trait]
impl Cluster for HttpCluster {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/nodes/{name}")))
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Self::decode(response, name).await
    }

    async fn register_node(&self, node: Node) -> Result<Node, ClusterError> {
        let response = self
            .client
            .post(self.url("/v1/nodes"))
            .json(&node)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Self::decode(response, &node.name).await
    }

    async fn update_node(&self, node: Node) -> Result<Node, ClusterError> {
        let response = self
            .client
            .put(self.url(&format!("/v1/nodes/{}", node.name)))
            .json(&node)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Self::decode(response, &node.name).await
    }

    async fn list_image_syncs(&self) -> Result<Vec<ImageSync>, ClusterError> {
        let response = self
            .client
            .get(self.url("/v1/imagesyncs"))
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Self::decode(response, "imagesyncs").await
    }

    async fn get_image_sync(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ImageSync, ClusterError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/namespaces/{namespace}/imagesyncs/{name}")))
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Self::decode(response, &format!("{namespace}/{name}")).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/namespaces/{namespace}/secrets/{name}")))
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Self::decode(response, &format!("{namespace}/{name}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let cluster = HttpCluster::new("http://controller:8080/", None, false).unwrap();
        assert_eq!(cluster.url("/v1/nodes"), "http://controller:8080/v1/nodes");
    }
}
