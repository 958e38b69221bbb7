//! Garbage collector.
//!
//! Periodically finds children whose owner reference no longer resolves to a
//! live solver, and cube states that went `Stale`, and deletes them. The
//! store listing of the child kinds is authoritative; index entries the
//! listing does not contain are checked individually, so children whose
//! events were missed are collected and ghost entries are dropped.
//!
//! Deletes are conditioned on the version the collector read. A child that
//! changed in between is left for the next pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use kubesolv_id::{ObjectRef, ResourceKind, SolverKey};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::executor::{Action, ActionExecutor, ActionOutcome};
use crate::index::DependencyIndex;
use crate::resources::{CubeStatePhase, Resource, Solver};
use crate::store::{ResourceStore, StoreResult};

/// Result of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Children examined.
    pub scanned: usize,
    /// Orphans deleted.
    pub orphans_collected: usize,
    /// Orphans that changed after they were read; re-examined next pass.
    pub skipped: usize,
    /// Index entries dropped because the child no longer exists.
    pub index_pruned: usize,
    /// Orphans whose deletion failed; retried next pass.
    pub failures: usize,
}

pub struct GarbageCollector {
    store: Arc<dyn ResourceStore>,
    index: Arc<DependencyIndex>,
    executor: Arc<ActionExecutor>,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        index: Arc<DependencyIndex>,
        executor: Arc<ActionExecutor>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            index,
            executor,
            interval,
        }
    }

    #[instrument(skip(self, shutdown), name = "garbage_collector")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting garbage collector"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.collect_once().await {
                        Ok(stats) if stats.orphans_collected > 0 || stats.failures > 0 => {
                            info!(
                                scanned = stats.scanned,
                                collected = stats.orphans_collected,
                                skipped = stats.skipped,
                                failures = stats.failures,
                                "Garbage collection pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Garbage collection pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Garbage collector shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one collection pass.
    pub async fn collect_once(&self) -> StoreResult<CollectionStats> {
        let mut stats = CollectionStats::default();

        let mut candidates: BTreeMap<ObjectRef, Resource> = BTreeMap::new();
        for kind in ResourceKind::CHILDREN {
            for child in self.store.list(kind).await? {
                candidates.insert(child.object_ref(), child);
            }
        }
        for (child, _) in self.index.child_entries().await {
            if candidates.contains_key(&child) {
                continue;
            }
            match self.store.get(&child).await? {
                Some(resource) => {
                    candidates.insert(child, resource);
                }
                None => {
                    debug!(child = %child, "Dropping index entry for missing child");
                    self.index.remove_child(&child).await;
                    stats.index_pruned += 1;
                }
            }
        }

        stats.scanned = candidates.len();
        let mut owners: HashMap<SolverKey, Option<Solver>> = HashMap::new();

        for (target, child) in candidates {
            let collectable = match (&child, child.owner()) {
                (Resource::CubeState(cube), _) if cube.status.phase == CubeStatePhase::Stale => {
                    true
                }
                (_, None) => true,
                (_, Some(owner)) => {
                    if !owners.contains_key(&owner.solver) {
                        let solver = self
                            .store
                            .get(&owner.solver.object_ref())
                            .await?
                            .and_then(Resource::into_solver);
                        owners.insert(owner.solver.clone(), solver);
                    }
                    !owners
                        .get(&owner.solver)
                        .and_then(Option::as_ref)
                        .is_some_and(|solver| owner.is_satisfied_by(solver))
                }
            };
            if !collectable {
                continue;
            }

            debug!(child = %target, "Collecting orphan");
            let action = Action::delete(target.clone(), child.resource_version());
            match self.executor.apply(action).await {
                ActionOutcome::Applied(_) => stats.orphans_collected += 1,
                ActionOutcome::Conflict => {
                    debug!(child = %target, "Child changed since it was read, skipping");
                    stats.skipped += 1;
                }
                outcome => {
                    warn!(child = %target, outcome = ?outcome, "Failed to collect orphan");
                    stats.failures += 1;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use kubesolv_id::{CubeStateKey, ResourceVersion, Uid};

    use super::*;
    use crate::executor::WritePolicy;
    use crate::resources::{CubeState, OwnerReference, SolverSpec};
    use crate::store::{InMemoryStore, Patch, WatchStream};
    use crate::substrate::MockSubstrate;

    fn collector(store: Arc<dyn ResourceStore>, index: Arc<DependencyIndex>) -> GarbageCollector {
        let executor = Arc::new(ActionExecutor::new(
            store.clone(),
            Arc::new(MockSubstrate::new()),
            WritePolicy::default(),
        ));
        GarbageCollector::new(store, index, executor, Duration::from_secs(30))
    }

    fn cube(name: &str, owner: OwnerReference) -> Resource {
        CubeState::new(
            CubeStateKey::new("default", name).unwrap(),
            owner,
            serde_json::json!({}),
        )
        .into()
    }

    async fn create_solver(store: &InMemoryStore, name: &str) -> Solver {
        let key = SolverKey::new("default", name).unwrap();
        store
            .create(Solver::new(key, SolverSpec::new("cfop")).into())
            .await
            .unwrap()
            .into_solver()
            .unwrap()
    }

    #[tokio::test]
    async fn test_collects_children_of_missing_and_recreated_solvers() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(DependencyIndex::new());
        let solver = create_solver(&store, "s1").await;

        store
            .create(cube("live", solver.owner_reference()))
            .await
            .unwrap();
        store
            .create(cube("old", OwnerReference::with_uid(solver.key(), Uid::new())))
            .await
            .unwrap();
        store
            .create(cube(
                "gone",
                OwnerReference::new(SolverKey::new("default", "s2").unwrap()),
            ))
            .await
            .unwrap();

        let gc = collector(store.clone(), index);
        let stats = gc.collect_once().await.unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.orphans_collected, 2);

        let remaining = store.list(ResourceKind::CubeState).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata().key.name(), "live");

        let again = gc.collect_once().await.unwrap();
        assert_eq!(again.orphans_collected, 0);
    }

    #[tokio::test]
    async fn test_collects_stale_cube_state_with_live_owner() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(DependencyIndex::new());
        let solver = create_solver(&store, "s1").await;
        let created = store
            .create(cube("c1", solver.owner_reference()))
            .await
            .unwrap()
            .into_cube_state()
            .unwrap();
        let mut status = created.status.clone();
        status.phase = CubeStatePhase::Stale;
        store
            .patch(
                &created.key().object_ref(),
                created.metadata.resource_version,
                Patch::status(status),
            )
            .await
            .unwrap();

        let stats = collector(store.clone(), index).collect_once().await.unwrap();
        assert_eq!(stats.orphans_collected, 1);
        assert!(store.list(ResourceKind::CubeState).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ghost_index_entries_are_pruned() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(DependencyIndex::new());
        let child = cube(
            "ghost",
            OwnerReference::new(SolverKey::new("default", "s1").unwrap()),
        );
        index
            .record_ownership(child.object_ref(), child.owner().unwrap().clone())
            .await;

        let gc = collector(store, index.clone());
        let stats = gc.collect_once().await.unwrap();
        assert_eq!(stats.scanned, 0);
        assert_eq!(stats.index_pruned, 1);
        assert_eq!(stats.orphans_collected, 0);
        assert!(index.child_entries().await.is_empty());

        let again = gc.collect_once().await.unwrap();
        assert_eq!(again, CollectionStats::default());
    }

    /// Recreates `default/c1` under `owner` right after the first listing of
    /// cube states, before the collector acts on what it listed.
    struct RecreateAfterList {
        inner: Arc<InMemoryStore>,
        owner: OwnerReference,
        fired: AtomicBool,
    }

    #[async_trait]
    impl ResourceStore for RecreateAfterList {
        async fn list(&self, kind: ResourceKind) -> StoreResult<Vec<Resource>> {
            let listing = self.inner.list(kind).await?;
            if kind == ResourceKind::CubeState && !self.fired.swap(true, Ordering::SeqCst) {
                let c1 = cube("c1", self.owner.clone());
                self.inner.delete(&c1.object_ref(), None).await?;
                self.inner.create(c1).await?;
            }
            Ok(listing)
        }

        async fn watch(&self, kind: ResourceKind) -> StoreResult<WatchStream> {
            self.inner.watch(kind).await
        }

        async fn get(&self, target: &ObjectRef) -> StoreResult<Option<Resource>> {
            self.inner.get(target).await
        }

        async fn create(&self, resource: Resource) -> StoreResult<Resource> {
            self.inner.create(resource).await
        }

        async fn patch(
            &self,
            target: &ObjectRef,
            expected: ResourceVersion,
            patch: Patch,
        ) -> StoreResult<Resource> {
            self.inner.patch(target, expected, patch).await
        }

        async fn delete(
            &self,
            target: &ObjectRef,
            expected: Option<ResourceVersion>,
        ) -> StoreResult<()> {
            self.inner.delete(target, expected).await
        }
    }

    #[tokio::test]
    async fn test_child_recreated_mid_pass_is_kept() {
        let inner = Arc::new(InMemoryStore::new());
        let live = create_solver(&inner, "live").await;
        inner
            .create(cube(
                "c1",
                OwnerReference::new(SolverKey::new("default", "gone").unwrap()),
            ))
            .await
            .unwrap();

        let store = Arc::new(RecreateAfterList {
            inner: inner.clone(),
            owner: live.owner_reference(),
            fired: AtomicBool::new(false),
        });
        let stats = collector(store, Arc::new(DependencyIndex::new()))
            .collect_once()
            .await
            .unwrap();
        assert_eq!(stats.orphans_collected, 0);
        assert_eq!(stats.skipped, 1);

        let remaining = inner.list(ResourceKind::CubeState).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].owner().map(|owner| owner.solver.name()),
            Some("live")
        );
    }
}
