//! Runtime client: the agent's view of the container runtime image service.
//!
//! A thin wrapper over the CRI `ImageService` that adds the two behaviors
//! the reconciler depends on: credential fall-through with a per-resource
//! cache, and status-backed pull/delete bookkeeping. Individual runtime
//! calls are serialised behind one async mutex; the runtime on the other end
//! of the socket is stateful.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use lagoon_api::qualified_name;
use lagoon_proto::cri::{
    AuthConfig, Image, ImageServiceClient, ImageSpec, ImageStatusRequest, ListImagesRequest,
    PullImageRequest,
};
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Dial timeout for the runtime socket.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive-message cap; image lists on busy nodes can be large.
pub const MAX_RECV_MSG_SIZE: usize = 1024 * 1024 * 32;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The image is not present. Normal before a pull, abnormal after one.
    #[error("image not found")]
    NotFound,

    /// Every supplied credential was tried and failed.
    #[error("unauthorized: all provided credentials failed")]
    Unauthorized,

    #[error("runtime rpc: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("runtime connection: {0}")]
    Connect(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Image details returned by pull/status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Content identifier (digest) of the image.
    pub id: String,

    /// Fully qualified name the lookup was made with.
    pub name: String,

    /// Repo tags the runtime associates with the image.
    pub tags: Vec<String>,
}

/// The consumed slice of the runtime's image service. A trait seam so tests
/// can substitute a fake runtime.
#[async_trait]
pub trait ImageApi: Send {
    async fn pull_image(&mut self, name: &str, auth: Option<AuthConfig>)
        -> Result<(), RuntimeError>;

    /// `None` when the image is not present on the node.
    async fn image_status(&mut self, name: &str) -> Result<Option<Image>, RuntimeError>;

    async fn list_images(&mut self) -> Result<Vec<Image>, RuntimeError>;
}

/// CRI-backed implementation over a unix-domain socket.
pub struct CriImages {
    client: ImageServiceClient<Channel>,
}

impl CriImages {
    /// Dial the runtime socket, e.g. `unix:///run/containerd/containerd.sock`.
    pub async fn connect(addr: &str) -> Result<Self, RuntimeError> {
        let path = addr
            .strip_prefix("unix://")
            .ok_or_else(|| RuntimeError::Connect(format!("expected unix:// address, got {addr}")))?
            .to_string();

        // The URI is ignored by the connector; the authority keeps hyper
        // happy.
        let channel = Endpoint::try_from("http://localhost")
            .map_err(|e| RuntimeError::Connect(e.to_string()))?
            .connect_timeout(CONNECTION_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;

        Ok(Self {
            client: ImageServiceClient::new(channel).max_decoding_message_size(MAX_RECV_MSG_SIZE),
        })
    }
}

#[async_trait]
impl ImageApi for CriImages {
    async fn pull_image(
        &mut self,
        name: &str,
        auth: Option<AuthConfig>,
    ) -> Result<(), RuntimeError> {
        self.client
            .pull_image(PullImageRequest {
                image: Some(ImageSpec {
                    image: name.to_string(),
                }),
                auth,
            })
            .await?;
        Ok(())
    }

    async fn image_status(&mut self, name: &str) -> Result<Option<Image>, RuntimeError> {
        let response = self
            .client
            .image_status(ImageStatusRequest {
                image: Some(ImageSpec {
                    image: name.to_string(),
                }),
                verbose: false,
            })
            .await?;
        Ok(response.into_inner().image)
    }

    async fn list_images(&mut self) -> Result<Vec<Image>, RuntimeError> {
        let response = self.client.list_images(ListImagesRequest { filter: None }).await?;
        Ok(response.into_inner().images)
    }
}

/// The agent-facing runtime client.
pub struct RuntimeClient {
    api: tokio::sync::Mutex<Box<dyn ImageApi>>,
    auth_cache: Mutex<HashMap<String, AuthConfig>>,
}

impl RuntimeClient {
    pub fn new(api: Box<dyn ImageApi>) -> Self {
        Self {
            api: tokio::sync::Mutex::new(api),
            auth_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the image is present, trying credentials in order: the cached
    /// winner for this resource first, then each supplied credential. The
    /// first credential that works is cached under the resource uid.
    ///
    /// Returns the post-pull status; [`RuntimeError::NotFound`] after a pull
    /// means the runtime lost the image and the caller should retry.
    pub async fn pull(
        &self,
        uid: &str,
        name: &str,
        auths: &[AuthConfig],
    ) -> Result<ImageInfo, RuntimeError> {
        let fqn = qualified_name(name);
        let mut api = self.api.lock().await;

        if auths.is_empty() {
            Self::ensure_pulled(api.as_mut(), &fqn, None).await?;
            return Self::status_locked(api.as_mut(), &fqn)
                .await?
                .ok_or(RuntimeError::NotFound);
        }

        let cached = self.cached_auth(uid);
        if let Some(auth) = cached {
            match Self::ensure_pulled(api.as_mut(), &fqn, Some(auth)).await {
                Ok(()) => {
                    return Self::status_locked(api.as_mut(), &fqn)
                        .await?
                        .ok_or(RuntimeError::NotFound);
                }
                Err(err) => {
                    debug!(image = %fqn, error = %err, "cached credential failed, falling through");
                    self.evict_auth(uid);
                }
            }
        }

        for auth in auths {
            match Self::ensure_pulled(api.as_mut(), &fqn, Some(auth.clone())).await {
                Ok(()) => {
                    self.cache_auth(uid, auth.clone());
                    return Self::status_locked(api.as_mut(), &fqn)
                        .await?
                        .ok_or(RuntimeError::NotFound);
                }
                Err(err) => {
                    debug!(image = %fqn, error = %err, "credential rejected, trying next");
                }
            }
        }

        Err(RuntimeError::Unauthorized)
    }

    /// Record the removal of an image claim. The image itself is left to the
    /// runtime's garbage collector; this returns the pre-removal status so
    /// the reference collection can decrement the right digest, and evicts
    /// the credential cached for the resource. An image the runtime no
    /// longer knows yields an empty-id info.
    pub async fn delete(&self, uid: &str, name: &str) -> Result<ImageInfo, RuntimeError> {
        let fqn = qualified_name(name);
        let info = {
            let mut api = self.api.lock().await;
            Self::status_locked(api.as_mut(), &fqn).await?
        };

        self.evict_auth(uid);

        Ok(info.unwrap_or(ImageInfo {
            id: String::new(),
            name: fqn,
            tags: Vec::new(),
        }))
    }

    /// Status for a single image; [`RuntimeError::NotFound`] when absent.
    pub async fn status(&self, name: &str) -> Result<ImageInfo, RuntimeError> {
        let fqn = qualified_name(name);
        let mut api = self.api.lock().await;
        Self::status_locked(api.as_mut(), &fqn)
            .await?
            .ok_or(RuntimeError::NotFound)
    }

    /// All image references present on the node, as reported by the
    /// runtime's repo tags.
    pub async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        let mut api = self.api.lock().await;
        let images = api.list_images().await?;

        let mut names: Vec<String> = images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn ensure_pulled(
        api: &mut dyn ImageApi,
        fqn: &str,
        auth: Option<AuthConfig>,
    ) -> Result<(), RuntimeError> {
        if api.image_status(fqn).await?.is_some() {
            return Ok(());
        }

        debug!(image = %fqn, "image not present, pulling");
        api.pull_image(fqn, auth).await
    }

    async fn status_locked(
        api: &mut dyn ImageApi,
        fqn: &str,
    ) -> Result<Option<ImageInfo>, RuntimeError> {
        let image = api.image_status(fqn).await?;
        Ok(image.map(|image| ImageInfo {
            id: image.id,
            name: fqn.to_string(),
            tags: image.repo_tags,
        }))
    }

    fn cached_auth(&self, uid: &str) -> Option<AuthConfig> {
        self.auth_cache.lock().expect("auth cache poisoned").get(uid).cloned()
    }

    fn cache_auth(&self, uid: &str, auth: AuthConfig) {
        self.auth_cache
            .lock()
            .expect("auth cache poisoned")
            .insert(uid.to_string(), auth);
    }

    fn evict_auth(&self, uid: &str) {
        self.auth_cache.lock().expect("auth cache poisoned").remove(uid);
    }

    #[cfg(test)]
    fn has_cached_auth(&self, uid: &str) -> bool {
        self.auth_cache.lock().unwrap().contains_key(uid)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory runtime used by unit and integration tests.

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    pub struct FakeState {
        /// Present images: fqn -> digest.
        pub present: BTreeMap<String, String>,

        /// Credentials accepted per registry host; empty accepts anonymous.
        pub accepted: Vec<AuthConfig>,

        /// Digests to assign on pull: fqn -> digest.
        pub digests: BTreeMap<String, String>,

        pub pull_count: u32,
    }

    /// Shared handle so tests can inspect and mutate runtime state while
    /// the client owns the `ImageApi` box.
    #[derive(Clone, Default)]
    pub struct FakeRuntime {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeRuntime {
        pub fn with_digest(self, fqn: &str, digest: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .digests
                .insert(fqn.to_string(), digest.to_string());
            self
        }

        pub fn accepting(self, auth: AuthConfig) -> Self {
            self.state.lock().unwrap().accepted.push(auth);
            self
        }
    }

    #[async_trait]
    impl ImageApi for FakeRuntime {
        async fn pull_image(
            &mut self,
            name: &str,
            auth: Option<AuthConfig>,
        ) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            state.pull_count += 1;

            if !state.accepted.is_empty() {
                let authorized = auth
                    .map(|a| state.accepted.iter().any(|want| *want == a))
                    .unwrap_or(false);
                if !authorized {
                    return Err(RuntimeError::Rpc(tonic::Status::unauthenticated(
                        "pull access denied",
                    )));
                }
            }

            let digest = state
                .digests
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("sha256:{name}"));
            state.present.insert(name.to_string(), digest);
            Ok(())
        }

        async fn image_status(&mut self, name: &str) -> Result<Option<Image>, RuntimeError> {
            let state = self.state.lock().unwrap();
            Ok(state.present.get(name).map(|digest| Image {
                id: digest.clone(),
                repo_tags: vec![name.to_string()],
                ..Default::default()
            }))
        }

        async fn list_images(&mut self) -> Result<Vec<Image>, RuntimeError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .present
                .iter()
                .map(|(name, digest)| Image {
                    id: digest.clone(),
                    repo_tags: vec![name.clone()],
                    ..Default::default()
                })
                .collect())
        }
    }
}
