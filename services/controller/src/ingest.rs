//! Watch ingestion.
//!
//! One ingestor per resource kind. It subscribes to the store's watch,
//! relists the kind so nothing that happened before the subscription is
//! missed, and then turns every event into:
//! 1. An update of the dependency index
//! 2. An enqueue of the changed identity
//! 3. Enqueues of the identities that depend on it (owner, input, consumers)
//!
//! If the watch falls behind, the ingestor resubscribes and relists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kubesolv_events::{Trigger, WatchEvent};
use kubesolv_id::{ResourceKind, SolverKey};
use kubesolv_reconcile::BackoffPolicy;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::index::DependencyIndex;
use crate::queue::WorkQueue;
use crate::resources::Resource;
use crate::store::{ResourceStore, StoreError, StoreResult, WatchStream};

/// Counters kept by an ingestor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub events: u64,
    pub relists: u64,
}

/// Feeds store watch events into the index and the work queue.
pub struct WatchIngestor {
    kind: ResourceKind,
    store: Arc<dyn ResourceStore>,
    index: Arc<DependencyIndex>,
    queue: Arc<WorkQueue>,
    reopen_backoff: BackoffPolicy,
    events: AtomicU64,
    relists: AtomicU64,
}

impl WatchIngestor {
    pub fn new(
        kind: ResourceKind,
        store: Arc<dyn ResourceStore>,
        index: Arc<DependencyIndex>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            kind,
            store,
            index,
            queue,
            reopen_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
            events: AtomicU64::new(0),
            relists: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            events: self.events.load(Ordering::Relaxed),
            relists: self.relists.load(Ordering::Relaxed),
        }
    }

    /// Run until the shutdown signal is received.
    #[instrument(skip(self, shutdown), fields(kind = %self.kind))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting watch ingestion");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if failures > 0 {
                let delay = self.reopen_backoff.delay(failures - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            let mut stream = match self.open().await {
                Ok(stream) => stream,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "Failed to open watch");
                    continue;
                }
            };

            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            failures = 0;
                            self.handle_event(event).await;
                        }
                        Some(Err(StoreError::WatchExpired { missed })) => {
                            warn!(missed, "Watch fell behind, relisting");
                            break;
                        }
                        Some(Err(e)) => {
                            failures = failures.saturating_add(1);
                            warn!(error = %e, "Watch stream failed, reopening");
                            break;
                        }
                        None => {
                            failures = failures.saturating_add(1);
                            warn!("Watch stream closed, reopening");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Watch ingestion shutting down");
                            return;
                        }
                    }
                }
            }
        }

        info!("Watch ingestion shutting down");
    }

    /// Subscribe first, then list, so no change falls between the two.
    async fn open(&self) -> StoreResult<WatchStream> {
        let stream = self.store.watch(self.kind).await?;
        self.relist().await?;
        Ok(stream)
    }

    /// Re-observe every object of this kind and prune what disappeared.
    pub async fn relist(&self) -> StoreResult<()> {
        let listing = self.store.list(self.kind).await?;
        let pruned = self.index.resync(self.kind, &listing).await;
        self.relists.fetch_add(1, Ordering::Relaxed);

        for gone in pruned {
            if gone.kind == ResourceKind::Solver {
                let solver = SolverKey::from_key(gone.key.clone());
                for child in self.index.remove_parent(&solver).await {
                    self.queue.enqueue(child, Trigger::OwnerRemoved);
                }
            }
            self.queue.enqueue(gone, Trigger::Resync);
        }

        for resource in &listing {
            self.queue.enqueue(resource.object_ref(), Trigger::Resync);
            self.fan_out(resource, Trigger::Resync).await;
        }

        debug!(objects = listing.len(), "Relisted");
        Ok(())
    }

    /// Apply one event to the index and queue everything it affects.
    pub async fn handle_event(&self, event: WatchEvent<Resource>) {
        self.events.fetch_add(1, Ordering::Relaxed);
        let orphaned = self.index.observe(&event).await;
        let target = event.object.object_ref();
        debug!(target = %target, event = %event.kind, "Observed change");

        self.queue.enqueue(target, Trigger::from(event.kind));
        self.fan_out(&event.object, Trigger::Dependency).await;
        for child in orphaned {
            self.queue.enqueue(child, Trigger::OwnerRemoved);
        }
    }

    async fn fan_out(&self, resource: &Resource, trigger: Trigger) {
        if let Some(owner) = resource.owner() {
            let trigger = if trigger == Trigger::Dependency {
                Trigger::Child
            } else {
                trigger
            };
            self.queue.enqueue(owner.solver.object_ref(), trigger);
        }

        match resource {
            Resource::SolveJob(job) => {
                self.queue.enqueue(job.spec.input.object_ref(), trigger);
            }
            Resource::CubeState(cube) => {
                for consumer in self.index.jobs_consuming(&cube.key()).await {
                    self.queue.enqueue(consumer.object_ref(), trigger);
                }
            }
            Resource::Solver(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use kubesolv_id::{CubeStateKey, SolveJobKey};

    use super::*;
    use crate::resources::{CubeState, OwnerReference, SolveJob, Solver, SolverSpec};
    use crate::store::InMemoryStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: Arc<DependencyIndex>,
        queue: Arc<WorkQueue>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryStore::new()),
                index: Arc::new(DependencyIndex::new()),
                queue: Arc::new(WorkQueue::new()),
            }
        }

        fn ingestor(&self, kind: ResourceKind) -> WatchIngestor {
            WatchIngestor::new(
                kind,
                self.store.clone(),
                self.index.clone(),
                self.queue.clone(),
            )
        }

        async fn drain(&self) -> Vec<String> {
            let mut seen = Vec::new();
            while !self.queue.is_empty() {
                let target = self.queue.dequeue().await.unwrap();
                seen.push(target.to_string());
                self.queue.done(&target);
            }
            seen.sort();
            seen
        }
    }

    fn solver_key() -> SolverKey {
        SolverKey::new("default", "s1").unwrap()
    }

    #[tokio::test]
    async fn test_job_event_fans_out_to_owner_and_input() {
        let fx = Fixture::new();
        let ingestor = fx.ingestor(ResourceKind::SolveJob);
        let job = SolveJob::new(
            SolveJobKey::new("default", "j1").unwrap(),
            OwnerReference::new(solver_key()),
            CubeStateKey::new("default", "c1").unwrap(),
        );

        ingestor.handle_event(WatchEvent::created(job.into())).await;

        assert_eq!(
            fx.drain().await,
            vec![
                "CubeState/default/c1",
                "SolveJob/default/j1",
                "Solver/default/s1",
            ]
        );
        assert_eq!(ingestor.stats().events, 1);
    }

    #[tokio::test]
    async fn test_solver_deletion_requeues_orphans() {
        let fx = Fixture::new();
        let ingestor = fx.ingestor(ResourceKind::Solver);
        let solver = Solver::new(solver_key(), SolverSpec::new("cfop"));
        let cube = CubeState::new(
            CubeStateKey::new("default", "c1").unwrap(),
            OwnerReference::new(solver_key()),
            serde_json::json!({}),
        );
        fx.index.observe(&WatchEvent::created(cube.into())).await;

        ingestor.handle_event(WatchEvent::deleted(solver.into())).await;

        assert_eq!(
            fx.drain().await,
            vec!["CubeState/default/c1", "Solver/default/s1"]
        );
        assert!(fx.index.children_of(&solver_key()).await.is_empty());
    }

    #[tokio::test]
    async fn test_relist_prunes_objects_missed_during_gap() {
        let fx = Fixture::new();
        let ingestor = fx.ingestor(ResourceKind::CubeState);
        let cube = CubeState::new(
            CubeStateKey::new("default", "c1").unwrap(),
            OwnerReference::new(solver_key()),
            serde_json::json!({}),
        );
        let created = fx.store.create(cube.into()).await.unwrap();
        ingestor.relist().await.unwrap();
        assert_eq!(fx.index.children_of(&solver_key()).await.len(), 1);
        fx.drain().await;

        fx.store.evict_silently(&created.object_ref()).await;
        ingestor.relist().await.unwrap();

        assert!(fx.index.children_of(&solver_key()).await.is_empty());
        assert_eq!(fx.drain().await, vec!["CubeState/default/c1"]);
        assert_eq!(ingestor.stats().relists, 2);
    }

    #[tokio::test]
    async fn test_run_ingests_until_shutdown() {
        let fx = Fixture::new();
        let ingestor = Arc::new(fx.ingestor(ResourceKind::Solver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run(shutdown_rx).await })
        };

        while ingestor.stats().relists == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.store
            .create(Solver::new(solver_key(), SolverSpec::new("cfop")).into())
            .await
            .unwrap();
        while ingestor.stats().events == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fx.index.has_solver(&solver_key()).await);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
