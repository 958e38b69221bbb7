//! SolveJob reconciliation.
//!
//! The job state machine:
//! - `Queued` + input `Ready` -> start an execution -> `Running`
//! - `Running` -> poll the substrate -> merge the output into the input cube
//!   state under its version token -> `Succeeded`, or `Failed`
//! - `Failed` with a retry scheduled -> `Queued` once the backoff elapsed
//!
//! `Succeeded`, and `Failed` without a retry scheduled, are terminal.

use std::time::Duration;

use chrono::Utc;
use kubesolv_id::SolveJobKey;
use kubesolv_reconcile::{Classify, SnapshotDigest};
use tracing::{debug, info, warn};

use super::{Pass, ReconcileError, ReconcileReport, ReconcileResult, Reconciler, Requeue};
use crate::executor::{Action, ActionError, ActionOutcome};
use crate::resources::{
    CubeState, CubeStatePhase, CubeStateSpec, CubeStateStatus, ExecutionHandle, FailureReason,
    JobError, SolveJob, SolveJobPhase, SolveJobStatus, Solver,
};
use crate::store::{Patch, StoreError};
use crate::substrate::{ExecutionRequest, ExecutionStatus, SubstrateError};

/// The references a job resolved to.
struct Resolved {
    solver: Solver,
    cube: CubeState,
}

impl Reconciler {
    pub(super) async fn reconcile_solve_job(
        &self,
        key: &SolveJobKey,
    ) -> ReconcileResult<ReconcileReport> {
        let Some(job) = self.get_solve_job(key).await? else {
            return Ok(ReconcileReport::done());
        };
        if job.metadata.is_deletion_requested() || job.status.is_terminal() {
            return Ok(ReconcileReport::done());
        }

        let mut pass = Pass::new(&self.executor);
        let resolved = match self.resolve_references(&job).await? {
            Ok(resolved) => resolved,
            Err(error) => {
                let requeue = self.fail_job(&mut pass, &job, error).await?;
                return Ok(pass.finish(requeue));
            }
        };

        let requeue = match job.status.phase {
            SolveJobPhase::Queued => self.start_job(&mut pass, &job, &resolved).await?,
            SolveJobPhase::Running => self.poll_job(&mut pass, &job, &resolved.cube).await?,
            SolveJobPhase::Failed => self.retry_job(&mut pass, &job).await?,
            SolveJobPhase::Succeeded => Requeue::Done,
        };
        Ok(pass.finish(requeue))
    }

    /// Load the owning solver and the input cube state and check that they
    /// belong together. A broken reference is reported as the job error to
    /// record.
    async fn resolve_references(
        &self,
        job: &SolveJob,
    ) -> ReconcileResult<Result<Resolved, JobError>> {
        let orphaned = |message: String| -> ReconcileResult<Result<Resolved, JobError>> {
            Ok(Err(JobError::new(FailureReason::OrphanedReference, message)))
        };

        let Some(owner) = &job.metadata.owner else {
            return orphaned("job has no owner reference".to_string());
        };
        let solver = match self.get_solver(&owner.solver).await? {
            Some(solver) if owner.is_satisfied_by(&solver) => solver,
            Some(_) => return orphaned(format!("solver {} was recreated", owner.solver)),
            None => return orphaned(format!("solver {} not found", owner.solver)),
        };

        let Some(cube) = self.get_cube_state(&job.spec.input).await? else {
            return orphaned(format!("input cube state {} not found", job.spec.input));
        };
        let same_owner = cube
            .metadata
            .owner
            .as_ref()
            .is_some_and(|cube_owner| cube_owner.is_satisfied_by(&solver));
        if !same_owner {
            return Ok(Err(JobError::new(
                FailureReason::InvalidReference,
                format!(
                    "input cube state {} is not owned by solver {}",
                    job.spec.input, owner.solver
                ),
            )));
        }

        Ok(Ok(Resolved { solver, cube }))
    }

    async fn start_job(
        &self,
        pass: &mut Pass<'_>,
        job: &SolveJob,
        resolved: &Resolved,
    ) -> ReconcileResult<Requeue> {
        let Resolved { solver, cube } = resolved;
        if cube.status.phase.is_terminal() {
            let error = JobError::new(
                FailureReason::OrphanedReference,
                format!("input cube state {} is {}", cube.key(), cube.status.phase),
            );
            return self.fail_job(pass, job, error).await;
        }
        if cube.status.phase != CubeStatePhase::Ready {
            debug!(input = %job.spec.input, phase = %cube.status.phase, "Waiting for input cube state");
            return Ok(Requeue::Done);
        }
        if solver.metadata.is_deletion_requested() {
            debug!("Owning solver is terminating, not starting");
            return Ok(Requeue::Done);
        }

        let admission = self.admission_lock(&solver.key());
        let _admission = admission.lock().await;

        let limit = solver.spec.concurrency_limit;
        if limit > 0 {
            let running = self.running_jobs(solver).await?;
            if running >= limit {
                debug!(running, limit, "Concurrency limit reached, waiting");
                return Ok(Requeue::After(self.settings.poll_interval));
            }
        }

        let handle = job.execution_handle();
        let mut parameters = solver.spec.parameters.clone();
        parameters.extend(job.spec.parameters.clone());
        let request = ExecutionRequest {
            handle: handle.clone(),
            job: job.key(),
            algorithm: solver.spec.algorithm.clone(),
            goal: job.spec.goal.clone().or_else(|| solver.spec.goal.clone()),
            parameters,
            input: cube.spec.snapshot.clone(),
        };

        match pass.apply_outcome(Action::StartExecution(request)).await {
            ActionOutcome::Applied(_) => {}
            ActionOutcome::Rejected(source) => {
                let error = JobError::new(FailureReason::StartRejected, source.to_string());
                return self.fail_job(pass, job, error).await;
            }
            ActionOutcome::Exhausted(source) => {
                return Err(ReconcileError::Exhausted {
                    action: "start_execution",
                    target: job.key().object_ref(),
                    source,
                });
            }
            ActionOutcome::Conflict => return Err(ReconcileError::Conflict(job.key().object_ref())),
        }

        let status = SolveJobStatus {
            phase: SolveJobPhase::Running,
            execution: Some(handle.clone()),
            input_version: Some(cube.metadata.resource_version),
            started_at: Some(Utc::now()),
            finished_at: None,
            next_retry_at: None,
            ..job.status.clone()
        };
        pass.apply(Action::patch(
            job.key().object_ref(),
            job.metadata.resource_version,
            Patch::status(status),
        ))
        .await?;

        info!(
            handle = %handle,
            attempt = job.status.retry_count,
            input_version = %cube.metadata.resource_version,
            "Started execution"
        );
        Ok(Requeue::After(self.settings.poll_interval))
    }

    async fn poll_job(
        &self,
        pass: &mut Pass<'_>,
        job: &SolveJob,
        cube: &CubeState,
    ) -> ReconcileResult<Requeue> {
        let Some(handle) = job.status.execution.clone() else {
            let error = JobError::new(
                FailureReason::ExecutionLost,
                "running job has no execution handle",
            );
            return self.fail_job(pass, job, error).await;
        };

        match self.substrate.poll_status(&handle).await {
            Ok(ExecutionStatus::Running) => Ok(Requeue::After(self.settings.poll_interval)),
            Ok(ExecutionStatus::Succeeded { output }) => {
                self.complete_job(pass, job, cube, handle, output).await
            }
            Ok(ExecutionStatus::Failed { reason }) => {
                let error = JobError::new(FailureReason::ExecutionFailed, reason);
                self.fail_job(pass, job, error).await
            }
            Err(SubstrateError::UnknownExecution(_)) => {
                let error = JobError::new(
                    FailureReason::ExecutionLost,
                    format!("substrate has no execution {handle}"),
                );
                self.fail_job(pass, job, error).await
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                let error = JobError::new(FailureReason::ExecutionFailed, e.to_string());
                self.fail_job(pass, job, error).await
            }
        }
    }

    /// Merge the execution output into the input cube state, conditioned on
    /// the version read when the execution started.
    async fn complete_job(
        &self,
        pass: &mut Pass<'_>,
        job: &SolveJob,
        cube: &CubeState,
        handle: ExecutionHandle,
        output: serde_json::Value,
    ) -> ReconcileResult<Requeue> {
        if cube.status.last_writer.as_ref() == Some(&handle) {
            debug!(handle = %handle, "Output already merged");
            return self.succeed_job(pass, job).await;
        }

        let expected = job
            .status
            .input_version
            .unwrap_or(cube.metadata.resource_version);
        let status = CubeStateStatus {
            phase: CubeStatePhase::Ready,
            revision: cube.status.revision + 1,
            snapshot_digest: Some(SnapshotDigest::from_json(&output).to_string()),
            last_writer: Some(handle.clone()),
            last_error: None,
        };
        let patch = Patch::spec(CubeStateSpec { snapshot: output }).with_status(status);

        match pass
            .apply_outcome(Action::patch(cube.key().object_ref(), expected, patch))
            .await
        {
            ActionOutcome::Applied(_) => {
                info!(handle = %handle, cube_state = %cube.key(), "Merged execution output");
                self.succeed_job(pass, job).await
            }
            ActionOutcome::Conflict => {
                let error = JobError::new(
                    FailureReason::Conflict,
                    format!(
                        "input cube state {} changed after version {expected} was read",
                        cube.key()
                    ),
                );
                self.fail_job(pass, job, error).await
            }
            ActionOutcome::Rejected(ActionError::Store(StoreError::NotFound(_))) => {
                let error = JobError::new(
                    FailureReason::OrphanedReference,
                    format!("input cube state {} was deleted", cube.key()),
                );
                self.fail_job(pass, job, error).await
            }
            ActionOutcome::Rejected(source) => Err(ReconcileError::Rejected {
                action: "patch",
                target: cube.key().object_ref(),
                source,
            }),
            ActionOutcome::Exhausted(source) => Err(ReconcileError::Exhausted {
                action: "patch",
                target: cube.key().object_ref(),
                source,
            }),
        }
    }

    async fn succeed_job(&self, pass: &mut Pass<'_>, job: &SolveJob) -> ReconcileResult<Requeue> {
        let status = SolveJobStatus {
            phase: SolveJobPhase::Succeeded,
            last_error: None,
            finished_at: Some(Utc::now()),
            next_retry_at: None,
            ..job.status.clone()
        };
        pass.apply(Action::patch(
            job.key().object_ref(),
            job.metadata.resource_version,
            Patch::status(status),
        ))
        .await?;
        Ok(Requeue::Done)
    }

    /// Mark the job failed and schedule a retry if the reason allows one and
    /// the budget is not spent.
    async fn fail_job(
        &self,
        pass: &mut Pass<'_>,
        job: &SolveJob,
        error: JobError,
    ) -> ReconcileResult<Requeue> {
        let now = Utc::now();
        let retry_delay = (error.reason.is_retryable()
            && job.status.retry_count < self.settings.max_job_retries)
            .then(|| self.settings.job_backoff.delay(job.status.retry_count));
        let next_retry_at = retry_delay.map(|delay| {
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now)
        });

        match retry_delay {
            Some(delay) => info!(
                reason = %error.reason,
                retry_count = job.status.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Job failed, retry scheduled"
            ),
            None => warn!(
                reason = %error.reason,
                retry_count = job.status.retry_count,
                error = %error.message,
                "Job failed permanently"
            ),
        }

        let status = SolveJobStatus {
            phase: SolveJobPhase::Failed,
            last_error: Some(error),
            finished_at: Some(now),
            next_retry_at,
            ..job.status.clone()
        };
        pass.apply(Action::patch(
            job.key().object_ref(),
            job.metadata.resource_version,
            Patch::status(status),
        ))
        .await?;

        Ok(retry_delay.map_or(Requeue::Done, Requeue::After))
    }

    /// Move a failed job back to `Queued` once its backoff elapsed.
    async fn retry_job(&self, pass: &mut Pass<'_>, job: &SolveJob) -> ReconcileResult<Requeue> {
        let Some(retry_at) = job.status.next_retry_at else {
            return Ok(Requeue::Done);
        };
        let remaining = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            return Ok(Requeue::After(remaining));
        }

        let status = SolveJobStatus {
            phase: SolveJobPhase::Queued,
            retry_count: job.status.retry_count + 1,
            execution: None,
            input_version: None,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            ..job.status.clone()
        };
        pass.apply(Action::patch(
            job.key().object_ref(),
            job.metadata.resource_version,
            Patch::status(status),
        ))
        .await?;

        debug!(retry_count = job.status.retry_count + 1, "Job requeued for retry");
        Ok(Requeue::Immediately)
    }

    /// Jobs of `solver` currently running, read from the store.
    async fn running_jobs(&self, solver: &Solver) -> ReconcileResult<u32> {
        let mut running = 0;
        for child in self.live_children(&solver.key()).await? {
            let is_running = child.as_solve_job().is_some_and(|job| {
                job.status.is_running()
                    && job
                        .metadata
                        .owner
                        .as_ref()
                        .is_some_and(|owner| owner.is_satisfied_by(solver))
            });
            if is_running {
                running += 1;
            }
        }
        Ok(running)
    }
}
