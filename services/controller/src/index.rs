//! Dependency index.
//!
//! A reverse mapping from each solver to the children that claim it as owner,
//! and from each cube state to the jobs that consume it. The watch ingestion
//! path writes it; reconcilers and the garbage collector read it. One
//! reader-writer lock guards all maps so a solver removal drops its whole
//! child set atomically.

use std::collections::{BTreeSet, HashMap};

use kubesolv_events::WatchEvent;
use kubesolv_id::{CubeStateKey, ObjectRef, ResourceKind, SolveJobKey, SolverKey, Uid};
use tokio::sync::RwLock;
use tracing::debug;

use crate::resources::{OwnerReference, Resource};

#[derive(Default)]
struct IndexState {
    /// Live solvers and their UIDs.
    solvers: HashMap<SolverKey, Option<Uid>>,

    /// Solver -> children that reference it.
    children: HashMap<SolverKey, BTreeSet<ObjectRef>>,

    /// Child -> the owner reference it carries.
    owners: HashMap<ObjectRef, OwnerReference>,

    /// Cube state -> jobs that take it as input.
    consumers: HashMap<CubeStateKey, BTreeSet<SolveJobKey>>,

    /// Job -> its input cube state.
    inputs: HashMap<SolveJobKey, CubeStateKey>,
}

impl IndexState {
    fn record_ownership(&mut self, child: ObjectRef, owner: OwnerReference) {
        if let Some(previous) = self.owners.get(&child) {
            if previous.solver != owner.solver {
                let previous = previous.solver.clone();
                self.detach_from(&previous, &child);
            }
        }
        self.children
            .entry(owner.solver.clone())
            .or_default()
            .insert(child.clone());
        self.owners.insert(child, owner);
    }

    fn detach_from(&mut self, solver: &SolverKey, child: &ObjectRef) {
        if let Some(set) = self.children.get_mut(solver) {
            set.remove(child);
            if set.is_empty() {
                self.children.remove(solver);
            }
        }
    }

    fn remove_child(&mut self, child: &ObjectRef) {
        if let Some(owner) = self.owners.remove(child) {
            self.detach_from(&owner.solver, child);
        }
        if child.kind == ResourceKind::SolveJob {
            let job = SolveJobKey::from_key(child.key.clone());
            self.unlink_input(&job);
        }
    }

    fn link_input(&mut self, job: SolveJobKey, input: CubeStateKey) {
        if self.inputs.get(&job) == Some(&input) {
            return;
        }
        self.unlink_input(&job);
        self.consumers
            .entry(input.clone())
            .or_default()
            .insert(job.clone());
        self.inputs.insert(job, input);
    }

    fn unlink_input(&mut self, job: &SolveJobKey) {
        if let Some(input) = self.inputs.remove(job) {
            if let Some(set) = self.consumers.get_mut(&input) {
                set.remove(job);
                if set.is_empty() {
                    self.consumers.remove(&input);
                }
            }
        }
    }

    fn remove_parent(&mut self, solver: &SolverKey) -> Vec<ObjectRef> {
        self.solvers.remove(solver);
        let children: Vec<ObjectRef> = self
            .children
            .remove(solver)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for child in &children {
            self.owners.remove(child);
        }
        children
    }

    fn observe_present(&mut self, resource: &Resource) {
        match resource {
            Resource::Solver(solver) => {
                self.solvers.insert(solver.key(), solver.metadata.uid);
            }
            Resource::CubeState(_) | Resource::SolveJob(_) => {
                let child = resource.object_ref();
                match resource.owner() {
                    Some(owner) => self.record_ownership(child.clone(), owner.clone()),
                    None => self.remove_child(&child),
                }
                if let Resource::SolveJob(job) = resource {
                    self.link_input(job.key(), job.spec.input.clone());
                }
            }
        }
    }
}

/// Reverse ownership and consumption index.
#[derive(Default)]
pub struct DependencyIndex {
    state: RwLock<IndexState>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `child` is owned by `owner`, replacing any previous owner.
    pub async fn record_ownership(&self, child: ObjectRef, owner: OwnerReference) {
        self.state.write().await.record_ownership(child, owner);
    }

    /// Forget a child.
    pub async fn remove_child(&self, child: &ObjectRef) {
        self.state.write().await.remove_child(child);
    }

    /// Forget a solver and atomically drop its child set, returning the
    /// children that were attached.
    pub async fn remove_parent(&self, solver: &SolverKey) -> Vec<ObjectRef> {
        let children = self.state.write().await.remove_parent(solver);
        if !children.is_empty() {
            debug!(solver = %solver, children = children.len(), "Dropped child set");
        }
        children
    }

    /// Children currently attached to `solver`.
    pub async fn children_of(&self, solver: &SolverKey) -> Vec<ObjectRef> {
        self.state
            .read()
            .await
            .children
            .get(solver)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of children of each kind attached to `solver`.
    pub async fn child_counts(&self, solver: &SolverKey) -> (u32, u32) {
        let state = self.state.read().await;
        let Some(set) = state.children.get(solver) else {
            return (0, 0);
        };
        let cubes = set
            .iter()
            .filter(|child| child.kind == ResourceKind::CubeState)
            .count();
        let jobs = set.len() - cubes;
        (
            u32::try_from(cubes).unwrap_or(u32::MAX),
            u32::try_from(jobs).unwrap_or(u32::MAX),
        )
    }

    /// The owner reference `child` was last seen with.
    pub async fn parent_of(&self, child: &ObjectRef) -> Option<OwnerReference> {
        self.state.read().await.owners.get(child).cloned()
    }

    /// Jobs whose input is `cube`.
    pub async fn jobs_consuming(&self, cube: &CubeStateKey) -> Vec<SolveJobKey> {
        self.state
            .read()
            .await
            .consumers
            .get(cube)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every indexed child with its owner reference.
    pub async fn child_entries(&self) -> Vec<(ObjectRef, OwnerReference)> {
        self.state
            .read()
            .await
            .owners
            .iter()
            .map(|(child, owner)| (child.clone(), owner.clone()))
            .collect()
    }

    /// Whether a live solver with this key has been observed.
    pub async fn has_solver(&self, solver: &SolverKey) -> bool {
        self.state.read().await.solvers.contains_key(solver)
    }

    /// Apply one watch event. For a solver deletion, returns the children that
    /// lost their parent.
    pub async fn observe(&self, event: &WatchEvent<Resource>) -> Vec<ObjectRef> {
        let mut state = self.state.write().await;
        if !event.is_deletion() {
            state.observe_present(&event.object);
            return Vec::new();
        }

        match &event.object {
            Resource::Solver(solver) => state.remove_parent(&solver.key()),
            child => {
                state.remove_child(&child.object_ref());
                Vec::new()
            }
        }
    }

    /// Replace everything known about `kind` with a fresh listing.
    ///
    /// Entries for objects missing from `listing` are pruned. Returns the
    /// identities that were pruned.
    pub async fn resync(&self, kind: ResourceKind, listing: &[Resource]) -> Vec<ObjectRef> {
        let mut state = self.state.write().await;
        let present: BTreeSet<ObjectRef> = listing.iter().map(Resource::object_ref).collect();

        let mut pruned = Vec::new();
        match kind {
            ResourceKind::Solver => {
                let gone: Vec<SolverKey> = state
                    .solvers
                    .keys()
                    .filter(|solver| !present.contains(&solver.object_ref()))
                    .cloned()
                    .collect();
                for solver in gone {
                    state.solvers.remove(&solver);
                    pruned.push(solver.object_ref());
                }
            }
            ResourceKind::CubeState | ResourceKind::SolveJob => {
                let mut known: BTreeSet<ObjectRef> = state
                    .owners
                    .keys()
                    .filter(|child| child.kind == kind)
                    .cloned()
                    .collect();
                if kind == ResourceKind::SolveJob {
                    known.extend(state.inputs.keys().map(SolveJobKey::object_ref));
                }
                let gone: Vec<ObjectRef> = known
                    .into_iter()
                    .filter(|child| !present.contains(child))
                    .collect();
                for child in gone {
                    state.remove_child(&child);
                    pruned.push(child);
                }
            }
        }

        for resource in listing.iter().filter(|r| r.kind() == kind) {
            state.observe_present(resource);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use kubesolv_id::ObjectKey;

    use super::*;
    use crate::resources::{CubeState, SolveJob, Solver, SolverSpec};

    fn solver_key() -> SolverKey {
        SolverKey::new("default", "s1").unwrap()
    }

    fn solver() -> Resource {
        let mut solver = Solver::new(solver_key(), SolverSpec::new("cfop"));
        solver.metadata.uid = Some(Uid::new());
        solver.into()
    }

    fn cube(name: &str) -> Resource {
        CubeState::new(
            CubeStateKey::new("default", name).unwrap(),
            OwnerReference::new(solver_key()),
            serde_json::json!({}),
        )
        .into()
    }

    fn job(name: &str, input: &str) -> Resource {
        SolveJob::new(
            SolveJobKey::new("default", name).unwrap(),
            OwnerReference::new(solver_key()),
            CubeStateKey::new("default", input).unwrap(),
        )
        .into()
    }

    #[tokio::test]
    async fn test_observe_tracks_children_and_consumers() {
        let index = DependencyIndex::new();
        index.observe(&WatchEvent::created(solver())).await;
        index.observe(&WatchEvent::created(cube("c1"))).await;
        index.observe(&WatchEvent::created(job("j1", "c1"))).await;
        index.observe(&WatchEvent::created(job("j2", "c1"))).await;

        assert!(index.has_solver(&solver_key()).await);
        assert_eq!(index.children_of(&solver_key()).await.len(), 3);
        assert_eq!(index.child_counts(&solver_key()).await, (1, 2));

        let c1 = CubeStateKey::new("default", "c1").unwrap();
        assert_eq!(index.jobs_consuming(&c1).await.len(), 2);

        index.observe(&WatchEvent::deleted(job("j1", "c1"))).await;
        assert_eq!(index.jobs_consuming(&c1).await.len(), 1);
        assert_eq!(index.child_counts(&solver_key()).await, (1, 1));
    }

    #[tokio::test]
    async fn test_solver_deletion_drops_child_set() {
        let index = DependencyIndex::new();
        index.observe(&WatchEvent::created(solver())).await;
        index.observe(&WatchEvent::created(cube("c1"))).await;
        index.observe(&WatchEvent::created(cube("c2"))).await;

        let removed = index.observe(&WatchEvent::deleted(solver())).await;
        assert_eq!(removed.len(), 2);
        assert!(index.children_of(&solver_key()).await.is_empty());
        assert!(index.child_entries().await.is_empty());
        assert!(!index.has_solver(&solver_key()).await);
    }

    #[tokio::test]
    async fn test_resync_prunes_missing_objects() {
        let index = DependencyIndex::new();
        index.observe(&WatchEvent::created(cube("c1"))).await;
        index.observe(&WatchEvent::created(cube("c2"))).await;

        let pruned = index.resync(ResourceKind::CubeState, &[cube("c2")]).await;
        assert_eq!(
            pruned,
            vec![ObjectRef::new(
                ResourceKind::CubeState,
                ObjectKey::new("default", "c1").unwrap()
            )]
        );
        assert_eq!(index.children_of(&solver_key()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_prunes_jobs_and_their_inputs() {
        let index = DependencyIndex::new();
        index.observe(&WatchEvent::created(job("j1", "c1"))).await;

        let pruned = index.resync(ResourceKind::SolveJob, &[]).await;
        assert_eq!(pruned.len(), 1);
        let c1 = CubeStateKey::new("default", "c1").unwrap();
        assert!(index.jobs_consuming(&c1).await.is_empty());
    }

    #[tokio::test]
    async fn test_reparenting_moves_child() {
        let index = DependencyIndex::new();
        let child = cube("c1").object_ref();
        index
            .record_ownership(child.clone(), OwnerReference::new(solver_key()))
            .await;

        let other = SolverKey::new("default", "s2").unwrap();
        index
            .record_ownership(child.clone(), OwnerReference::new(other.clone()))
            .await;

        assert!(index.children_of(&solver_key()).await.is_empty());
        assert_eq!(index.children_of(&other).await, vec![child.clone()]);
        assert_eq!(index.parent_of(&child).await.unwrap().solver, other);

        index.remove_child(&child).await;
        assert!(index.parent_of(&child).await.is_none());
    }
}
