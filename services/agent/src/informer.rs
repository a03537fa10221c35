//! ImageSync informer and reconcile dispatcher.
//!
//! The informer keeps the work queue fed: it periodically lists ImageSyncs
//! through the cluster client, fingerprints each object, and enqueues the
//! ones that changed since the previous poll. Unprocessed objects (no
//! status revision yet) are skipped; their canonicalisation is not frozen
//! until the controller has seen them, so the create event is a no-op.
//! Objects that vanish from the list are enqueued once more and settle in
//! the reconciler's not-found branch.
//!
//! The dispatcher drains the queue with a bounded set of workers, requeues
//! failures with backoff, and forgets keys on success.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lagoon_cluster::{Cluster, ClusterError};
use lagoon_reconcile::WorkQueue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::reconciler::Reconciler;

/// Change fingerprint: generation, deleting, frozen status revision.
type Fingerprint = (i64, bool, String);

pub struct Informer {
    cluster: Arc<dyn Cluster>,
    queue: Arc<WorkQueue>,
    resync_interval: Duration,
}

impl Informer {
    pub fn new(cluster: Arc<dyn Cluster>, queue: Arc<WorkQueue>, resync_interval: Duration) -> Self {
        Self {
            cluster,
            queue,
            resync_interval,
        }
    }

    /// Poll until shutdown. List failures are logged and retried on the
    /// next tick; the queue keeps whatever state it already has.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut known: HashMap<String, Fingerprint> = HashMap::new();
        let mut interval = tokio::time::interval(self.resync_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sync(&mut known).await {
                        warn!(error = %err, "imagesync list failed, will retry");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("informer shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sync(&self, known: &mut HashMap<String, Fingerprint>) -> Result<(), ClusterError> {
        let syncs = self.cluster.list_image_syncs().await?;

        let mut seen: HashSet<String> = HashSet::with_capacity(syncs.len());
        for sync in syncs {
            if !sync.is_processed() {
                continue;
            }

            let key = sync.key();
            let fingerprint = (
                sync.generation,
                sync.is_deleting(),
                sync.status.revision.clone(),
            );
            seen.insert(key.clone());

            if known.get(&key) != Some(&fingerprint) {
                debug!(key = %key, "imagesync changed, enqueueing");
                known.insert(key.clone(), fingerprint);
                self.queue.add(&key);
            }
        }

        // One final reconcile for objects that left the store.
        known.retain(|key, _| {
            let keep = seen.contains(key);
            if !keep {
                debug!(key = %key, "imagesync vanished, enqueueing final reconcile");
                self.queue.add(key);
            }
            keep
        });

        Ok(())
    }
}

/// Reconcile dispatcher: a bounded pool of workers draining the queue.
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>, workers: usize) -> Self {
        Self {
            queue,
            reconciler,
            workers,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();

        for worker_id in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let mut shutdown = shutdown.clone();

            workers.spawn(async move {
                debug!(worker_id, "reconcile worker started");
                loop {
                    tokio::select! {
                        key = queue.next() => {
                            let Some(key) = key else { break };
                            let Some((namespace, name)) = key.split_once('/') else {
                                warn!(key = %key, "malformed queue key, dropping");
                                continue;
                            };

                            match reconciler.reconcile(namespace, name).await {
                                Ok(()) => queue.forget(&key),
                                Err(err) => {
                                    warn!(
                                        key = %key,
                                        error = %err,
                                        failures = queue.failure_count(&key) + 1,
                                        "reconcile failed, requeueing"
                                    );
                                    queue.requeue(&key);
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                // Drain whatever is already queued, then exit.
                                while let Some(key) = queue.try_next() {
                                    if let Some((namespace, name)) = key.split_once('/') {
                                        if let Err(err) = reconciler.reconcile(namespace, name).await {
                                            warn!(key = %key, error = %err, "reconcile failed during drain");
                                        }
                                    }
                                }
                                debug!(worker_id, "reconcile worker shutting down");
                                break;
                            }
                        }
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }
}
