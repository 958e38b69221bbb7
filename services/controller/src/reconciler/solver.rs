//! Solver reconciliation: activation, child accounting, seeding, and the
//! finalizer-driven deletion drain.

use kubesolv_id::SolverKey;
use tracing::{debug, info};

use super::{Pass, ReconcileReport, ReconcileResult, Reconciler, Requeue};
use crate::executor::Action;
use crate::resources::{
    CubeState, Resource, Solver, SolverPhase, SolverStatus, CASCADE_FINALIZER,
};
use crate::store::Patch;

/// Children of one solver, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildCounts {
    pub cube_states: u32,
    pub solve_jobs: u32,
    pub running_jobs: u32,
}

impl ChildCounts {
    fn tally(solver: &Solver, children: &[Resource]) -> Self {
        let mut counts = ChildCounts::default();
        for child in children {
            let owned = child
                .owner()
                .is_some_and(|owner| owner.is_satisfied_by(solver));
            if !owned {
                continue;
            }
            match child {
                Resource::CubeState(_) => counts.cube_states += 1,
                Resource::SolveJob(job) => {
                    counts.solve_jobs += 1;
                    if job.status.is_running() {
                        counts.running_jobs += 1;
                    }
                }
                Resource::Solver(_) => {}
            }
        }
        counts
    }
}

/// The single patch that brings a live solver up to date, if any.
///
/// Adds the cascade finalizer, moves the phase to `Active` when the spec
/// generation has not been observed yet, and records child counts.
pub fn plan_live_solver(solver: &Solver, counts: ChildCounts) -> Option<Patch> {
    let mut patch = Patch::default();
    if !solver.metadata.has_finalizer(CASCADE_FINALIZER) {
        patch = patch.adding_finalizer(CASCADE_FINALIZER);
    }

    let mut status = solver.status.clone();
    if status.observed_generation != solver.metadata.generation {
        status.phase = SolverPhase::Active;
        status.observed_generation = solver.metadata.generation;
        status.last_error = None;
    }
    status.cube_states = counts.cube_states;
    status.solve_jobs = counts.solve_jobs;
    status.running_jobs = counts.running_jobs;

    if status != solver.status {
        patch = patch.with_status(status);
    }

    (!patch.is_empty()).then_some(patch)
}

impl Reconciler {
    pub(super) async fn reconcile_solver(&self, key: &SolverKey) -> ReconcileResult<ReconcileReport> {
        let Some(solver) = self.get_solver(key).await? else {
            return Ok(ReconcileReport::done());
        };
        let mut pass = Pass::new(&self.executor);
        let children = self.live_children(key).await?;

        if solver.metadata.is_deletion_requested() {
            let requeue = self.drain_solver(&mut pass, &solver, &children).await?;
            return Ok(pass.finish(requeue));
        }

        let counts = ChildCounts::tally(&solver, &children);
        if let Some(patch) = plan_live_solver(&solver, counts) {
            pass.apply(Action::patch(
                key.object_ref(),
                solver.metadata.resource_version,
                patch,
            ))
            .await?;
        }

        if let Some(seed) = self.missing_seed(&solver).await? {
            info!(cube_state = %seed.key(), "Creating seed cube state");
            pass.apply(Action::Create(seed.into())).await?;
        }

        Ok(pass.finish(Requeue::Done))
    }

    /// Delete every remaining child, then release the solver.
    async fn drain_solver(
        &self,
        pass: &mut Pass<'_>,
        solver: &Solver,
        children: &[Resource],
    ) -> ReconcileResult<Requeue> {
        let target = solver.key().object_ref();
        let terminating = SolverStatus {
            phase: SolverPhase::Terminating,
            ..solver.status.clone()
        };

        if !children.is_empty() {
            if solver.status.phase != SolverPhase::Terminating {
                info!(children = children.len(), "Draining solver");
                pass.apply(Action::patch(
                    target,
                    solver.metadata.resource_version,
                    Patch::status(terminating),
                ))
                .await?;
            }
            for child in children {
                if !child.metadata().is_deletion_requested() {
                    pass.apply(Action::delete(child.object_ref(), child.resource_version()))
                        .await?;
                }
            }
            return Ok(Requeue::After(self.settings.drain_interval));
        }

        let mut patch = Patch::default();
        if solver.metadata.has_finalizer(CASCADE_FINALIZER) {
            patch = patch.removing_finalizer(CASCADE_FINALIZER);
        }
        if solver.status.phase != SolverPhase::Terminating {
            patch = patch.with_status(terminating);
        }
        if !patch.is_empty() {
            debug!("No children left, finalizing solver");
            pass.apply(Action::patch(target, solver.metadata.resource_version, patch))
                .await?;
        }
        Ok(Requeue::Done)
    }

    /// The seed cube state to create, if the solver asks for one and it does
    /// not exist yet.
    async fn missing_seed(&self, solver: &Solver) -> ReconcileResult<Option<CubeState>> {
        let Some(snapshot) = &solver.spec.initial_state else {
            return Ok(None);
        };
        let Ok(key) = solver.seed_cube_key() else {
            debug!("Solver name too long for a seed cube state");
            return Ok(None);
        };
        if self.store.get(&key.object_ref()).await?.is_some() {
            return Ok(None);
        }
        Ok(Some(CubeState::new(
            key,
            solver.owner_reference(),
            snapshot.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use kubesolv_id::{CubeStateKey, SolveJobKey, Uid};

    use super::*;
    use crate::resources::{SolveJob, SolveJobPhase, SolverSpec};

    fn solver() -> Solver {
        let mut solver = Solver::new(
            SolverKey::new("default", "s1").unwrap(),
            SolverSpec::new("cfop"),
        );
        solver.metadata.uid = Some(Uid::new());
        solver
    }

    #[test]
    fn test_new_solver_gets_finalizer_and_activates() {
        let solver = solver();
        let patch = plan_live_solver(&solver, ChildCounts::default()).unwrap();
        assert_eq!(patch.add_finalizers, vec![CASCADE_FINALIZER.to_string()]);

        let mut resource: Resource = solver.into();
        patch.apply_to(&mut resource).unwrap();
        let solver = resource.into_solver().unwrap();
        assert_eq!(solver.status.phase, SolverPhase::Active);
        assert_eq!(solver.status.observed_generation, 1);
    }

    #[test]
    fn test_converged_solver_needs_no_patch() {
        let mut solver = solver();
        solver.metadata.finalizers.push(CASCADE_FINALIZER.to_string());
        solver.status.phase = SolverPhase::Active;
        solver.status.observed_generation = 1;
        assert!(plan_live_solver(&solver, ChildCounts::default()).is_none());
    }

    #[test]
    fn test_generation_bump_clears_last_error() {
        let mut solver = solver();
        solver.metadata.finalizers.push(CASCADE_FINALIZER.to_string());
        solver.metadata.generation = 2;
        solver.status.phase = SolverPhase::Active;
        solver.status.observed_generation = 1;
        solver.status.last_error = Some("old".to_string());

        let patch = plan_live_solver(&solver, ChildCounts::default()).unwrap();
        let mut resource: Resource = solver.into();
        patch.apply_to(&mut resource).unwrap();
        let status = resource.into_solver().unwrap().status;
        assert_eq!(status.observed_generation, 2);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_tally_ignores_children_of_older_incarnation() {
        let solver = solver();
        let owned = solver.owner_reference();
        let stale = crate::resources::OwnerReference::with_uid(solver.key(), Uid::new());

        let cube: Resource = CubeState::new(
            CubeStateKey::new("default", "c1").unwrap(),
            owned.clone(),
            serde_json::json!({}),
        )
        .into();
        let mut running = SolveJob::new(
            SolveJobKey::new("default", "j1").unwrap(),
            owned,
            CubeStateKey::new("default", "c1").unwrap(),
        );
        running.status.phase = SolveJobPhase::Running;
        let orphan: Resource = SolveJob::new(
            SolveJobKey::new("default", "j2").unwrap(),
            stale,
            CubeStateKey::new("default", "c1").unwrap(),
        )
        .into();

        let counts = ChildCounts::tally(&solver, &[cube, running.into(), orphan]);
        assert_eq!(
            counts,
            ChildCounts {
                cube_states: 1,
                solve_jobs: 1,
                running_jobs: 1,
            }
        );
    }
}
