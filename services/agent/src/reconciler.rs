//! The observe-diff-act-project loop for a single ImageSync.
//!
//! One reconcile: snapshot the node and the object, diff the declared image
//! set against the claims this resource holds locally, fan the resulting
//! pulls and deletes out through the node-global puller pool, then project
//! the node labels exactly once. The first failing worker aborts the rest
//! and the reconcile is requeued by the dispatcher; labels are only written
//! after a clean join so a failed group never leaves them half-updated.

use std::collections::BTreeMap;
use std::sync::Arc;

use lagoon_api::qualified_name;
use lagoon_cluster::Cluster;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::auth::Keyring;
use crate::error::AgentError;
use crate::node::NodeLabels;
use crate::observe::StateObserver;
use crate::references::References;
use crate::runtime::RuntimeClient;

pub struct Reconciler {
    cluster: Arc<dyn Cluster>,
    runtime: Arc<RuntimeClient>,
    references: Arc<References>,
    labels: NodeLabels,

    /// Serialises label projection across concurrent reconciles.
    label_lock: Mutex<()>,

    /// Node-global bound on concurrent runtime calls; shared across every
    /// in-flight reconcile, not per resource.
    pullers: Arc<Semaphore>,

    /// Last observed uid per object key. The informer polls, so an object
    /// can leave the store between observations; this map lets the
    /// not-found branch release the claims the object held.
    known_uids: std::sync::Mutex<std::collections::HashMap<String, String>>,

    node_name: String,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        runtime: Arc<RuntimeClient>,
        references: Arc<References>,
        pullers: Arc<Semaphore>,
        node_name: &str,
    ) -> Self {
        let labels = NodeLabels::new(Arc::clone(&cluster), node_name);
        Self {
            cluster,
            runtime,
            references,
            labels,
            label_lock: Mutex::new(()),
            pullers,
            known_uids: std::sync::Mutex::new(std::collections::HashMap::new()),
            node_name: node_name.to_string(),
        }
    }

    /// Run one reconcile for `namespace/name`. Errors are retryable and the
    /// caller requeues with backoff.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), AgentError> {
        let observer = StateObserver {
            cluster: self.cluster.as_ref(),
            node_name: &self.node_name,
        };

        let key = format!("{namespace}/{name}");
        let observed = match observer.observe(namespace, name).await {
            Ok(observed) => observed,
            Err(AgentError::ImageSyncNotFound) => {
                // Terminal: the object is gone. If it vanished before this
                // agent observed the deletion timestamp, release whatever
                // claims it still holds here.
                let uid = self.known_uids.lock().expect("uid map poisoned").remove(&key);
                let Some(uid) = uid else {
                    debug!(namespace, name, "imagesync gone, nothing to do");
                    return Ok(());
                };
                return self.release_claims(&uid).await;
            }
            Err(AgentError::NodeMatch { sync }) => {
                // Selector drift is handled exactly like a delete of the
                // resource's claims on this node.
                self.remember_uid(&key, &sync.uid);
                return self.release_claims(&sync.uid).await;
            }
            Err(err) => return Err(err),
        };

        let sync = &observed.image_sync;
        self.remember_uid(&key, &sync.uid);
        let purge = sync.is_deleting();

        let desired: Vec<String> = sync
            .spec
            .images
            .iter()
            .map(|image| qualified_name(image))
            .collect();

        let mut seen: BTreeMap<String, bool> = self
            .references
            .image_list_for_uid(&sync.uid)
            .into_iter()
            .map(|name| (name, false))
            .collect();
        for name in &desired {
            seen.insert(name.clone(), true);
        }

        debug!(
            namespace,
            name,
            uid = %sync.uid,
            images = seen.len(),
            purge,
            "converging imagesync"
        );

        let keyring = Keyring::from_secrets(&observed.pull_secrets);
        self.converge(&sync.uid, seen, purge, &keyring).await?;
        self.project_labels().await
    }

    /// Release every claim the resource holds on this node. A no-op when it
    /// never claimed anything here.
    async fn release_claims(&self, uid: &str) -> Result<(), AgentError> {
        if !self.references.has_uid(uid) {
            return Ok(());
        }

        info!(uid, "imagesync no longer applies to this node, releasing claims");

        let seen: BTreeMap<String, bool> = self
            .references
            .image_list_for_uid(uid)
            .into_iter()
            .map(|name| (name, false))
            .collect();

        self.converge(uid, seen, true, &Keyring::empty()).await?;
        self.project_labels().await
    }

    fn remember_uid(&self, key: &str, uid: &str) {
        self.known_uids
            .lock()
            .expect("uid map poisoned")
            .insert(key.to_string(), uid.to_string());
    }

    /// Fan the add/delete tasks out under the puller semaphore and wait for
    /// the group. The first failure aborts the remaining workers and is
    /// returned.
    async fn converge(
        &self,
        uid: &str,
        seen: BTreeMap<String, bool>,
        purge: bool,
        keyring: &Keyring,
    ) -> Result<(), AgentError> {
        let mut tasks: JoinSet<Result<(), AgentError>> = JoinSet::new();

        for (image, present) in seen {
            let delete = purge || !present;
            let auths = if delete { Vec::new() } else { keyring.lookup(&image) };
            let uid = uid.to_string();
            let runtime = Arc::clone(&self.runtime);
            let references = Arc::clone(&self.references);
            let pullers = Arc::clone(&self.pullers);

            tasks.spawn(async move {
                let _permit = pullers
                    .acquire_owned()
                    .await
                    .expect("puller semaphore closed");

                if delete {
                    let info = runtime.delete(&uid, &image).await?;
                    references.remove(&uid, &image, &info.id);
                } else {
                    let info = runtime.pull(&uid, &image, &auths).await?;
                    references.add(&uid, &image, &info.id);
                }

                Ok(())
            });
        }

        let mut first_error: Option<AgentError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        tasks.abort_all();
                        first_error = Some(err);
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => std::panic::resume_unwind(join_err.into_panic()),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Project node labels from the post-mutation reference collection.
    /// Taken after the worker group joins, under the agent-wide label lock,
    /// so concurrent reconciles cannot interleave erase-then-write cycles.
    async fn project_labels(&self) -> Result<(), AgentError> {
        let _guard = self.label_lock.lock().await;
        self.labels.project(&self.references).await
    }
}
