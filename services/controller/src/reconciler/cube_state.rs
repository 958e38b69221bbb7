//! CubeState reconciliation.
//!
//! A cube state is mostly passive. Its snapshot is only rewritten when a
//! solve job completes; here we track its phase, owner validity and the
//! digest/revision of the snapshot it holds.

use kubesolv_id::CubeStateKey;
use kubesolv_reconcile::SnapshotDigest;
use tracing::info;

use super::{Pass, ReconcileReport, ReconcileResult, Reconciler, Requeue};
use crate::executor::Action;
use crate::resources::{CubeState, CubeStatePhase, CubeStateStatus, FailureReason};
use crate::store::Patch;

/// The status a cube state should carry.
///
/// `owner_error` is set when the owner reference does not resolve to a live
/// solver; `has_consumers` when at least one job takes the cube as input.
pub fn plan_cube_state(
    cube: &CubeState,
    owner_error: Option<&str>,
    has_consumers: bool,
) -> CubeStateStatus {
    let mut status = cube.status.clone();

    if cube.metadata.is_deletion_requested() {
        status.phase = CubeStatePhase::Deleted;
        return status;
    }
    if status.phase.is_terminal() {
        return status;
    }
    if let Some(message) = owner_error {
        status.phase = CubeStatePhase::Stale;
        status.last_error = Some(format!("{}: {message}", FailureReason::OrphanedReference));
        return status;
    }

    let digest = SnapshotDigest::from_json(&cube.spec.snapshot);
    match status.phase {
        CubeStatePhase::Initializing if has_consumers => {
            status.phase = CubeStatePhase::Ready;
            status.snapshot_digest = Some(digest.to_string());
            status.last_error = None;
        }
        CubeStatePhase::Ready if !digest.matches(status.snapshot_digest.as_deref()) => {
            // Snapshot edited outside of a job completion.
            status.revision += 1;
            status.snapshot_digest = Some(digest.to_string());
            status.last_writer = None;
        }
        _ => {}
    }
    status
}

impl Reconciler {
    pub(super) async fn reconcile_cube_state(
        &self,
        key: &CubeStateKey,
    ) -> ReconcileResult<ReconcileReport> {
        let Some(cube) = self.get_cube_state(key).await? else {
            return Ok(ReconcileReport::done());
        };
        let mut pass = Pass::new(&self.executor);

        let owner_error = match &cube.metadata.owner {
            None => Some("no owner reference".to_string()),
            Some(owner) => match self.get_solver(&owner.solver).await? {
                Some(solver) if owner.is_satisfied_by(&solver) => None,
                Some(_) => Some(format!("solver {} was recreated", owner.solver)),
                None => Some(format!("solver {} not found", owner.solver)),
            },
        };
        let has_consumers = !self.index.jobs_consuming(key).await.is_empty();

        let status = plan_cube_state(&cube, owner_error.as_deref(), has_consumers);
        if status != cube.status {
            if status.phase != cube.status.phase {
                info!(from = %cube.status.phase, to = %status.phase, "Cube state phase change");
            }
            pass.apply(Action::patch(
                key.object_ref(),
                cube.metadata.resource_version,
                Patch::status(status),
            ))
            .await?;
        }

        Ok(pass.finish(Requeue::Done))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use kubesolv_id::SolverKey;
    use rstest::rstest;

    use super::*;
    use crate::resources::OwnerReference;

    fn cube(phase: CubeStatePhase) -> CubeState {
        let mut cube = CubeState::new(
            CubeStateKey::new("default", "c1").unwrap(),
            OwnerReference::new(SolverKey::new("default", "s1").unwrap()),
            serde_json::json!({ "faces": "RUF" }),
        );
        cube.status.phase = phase;
        cube
    }

    #[rstest]
    #[case::passive_without_consumers(CubeStatePhase::Initializing, false, CubeStatePhase::Initializing)]
    #[case::ready_once_consumed(CubeStatePhase::Initializing, true, CubeStatePhase::Ready)]
    #[case::stale_stays_stale(CubeStatePhase::Stale, true, CubeStatePhase::Stale)]
    #[case::deleted_stays_deleted(CubeStatePhase::Deleted, true, CubeStatePhase::Deleted)]
    fn test_phase_transitions(
        #[case] from: CubeStatePhase,
        #[case] has_consumers: bool,
        #[case] expected: CubeStatePhase,
    ) {
        let status = plan_cube_state(&cube(from), None, has_consumers);
        assert_eq!(status.phase, expected);
    }

    #[test]
    fn test_ready_records_digest() {
        let cube = cube(CubeStatePhase::Initializing);
        let status = plan_cube_state(&cube, None, true);
        let digest = SnapshotDigest::from_json(&cube.spec.snapshot);
        assert!(digest.matches(status.snapshot_digest.as_deref()));
        assert_eq!(status.revision, 0);
    }

    #[test]
    fn test_external_snapshot_edit_bumps_revision() {
        let mut cube = cube(CubeStatePhase::Initializing);
        cube.status = plan_cube_state(&cube, None, true);
        assert_eq!(plan_cube_state(&cube, None, true), cube.status);

        cube.spec.snapshot = serde_json::json!({ "faces": "UUU" });
        let status = plan_cube_state(&cube, None, true);
        assert_eq!(status.revision, 1);
        assert_eq!(status.phase, CubeStatePhase::Ready);
    }

    #[test]
    fn test_orphaned_cube_goes_stale() {
        let status = plan_cube_state(
            &cube(CubeStatePhase::Ready),
            Some("solver default/s1 not found"),
            true,
        );
        assert_eq!(status.phase, CubeStatePhase::Stale);
        assert!(status.last_error.unwrap().starts_with("OrphanedReference"));
    }

    #[test]
    fn test_deletion_request_wins() {
        let mut cube = cube(CubeStatePhase::Ready);
        cube.metadata.deletion_requested_at = Some(Utc::now());
        let status = plan_cube_state(&cube, Some("gone"), true);
        assert_eq!(status.phase, CubeStatePhase::Deleted);
    }
}
