//! Reconciler.
//!
//! For one identity, reads current state from the store, compares desired
//! and observed state, and applies the corrective actions through the
//! [`ActionExecutor`]. A pass never returns an error to its caller: every
//! failure is classified and turned into either a status update on the
//! resource or a delayed requeue.
//!
//! Passes are idempotent. Running a pass on state it already converged
//! applies no actions.

mod cube_state;
mod solve_job;
mod solver;

pub use cube_state::plan_cube_state;
pub use solver::{plan_live_solver, ChildCounts};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kubesolv_id::{CubeStateKey, ObjectRef, ResourceKind, SolveJobKey, SolverKey};
use kubesolv_reconcile::{BackoffPolicy, Classify, ErrorClass, RetryTracker, DEFAULT_RETRY_WINDOW};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::executor::{Action, ActionError, ActionExecutor, ActionOutcome};
use crate::index::DependencyIndex;
use crate::resources::{
    CubeState, FailureReason, JobError, Resource, SolveJob, SolveJobPhase, Solver,
};
use crate::store::{Patch, ResourceStore, StoreError};
use crate::substrate::{ExecutionSubstrate, SubstrateError};

/// Tunables for reconciliation passes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerSettings {
    /// Retries a solve job gets after its first attempt.
    pub max_job_retries: u32,

    /// Delay before a failed job is queued again.
    pub job_backoff: BackoffPolicy,

    /// How often a deleting solver re-checks for remaining children.
    pub drain_interval: Duration,

    /// How often a running job polls the substrate.
    pub poll_interval: Duration,

    /// Requeue delay after a transient reconcile failure.
    pub error_backoff: BackoffPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            max_job_retries: 3,
            job_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            drain_interval: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            error_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30)),
        }
    }
}

/// When to look at an identity again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Converged; wait for the next change.
    Done,
    Immediately,
    After(Duration),
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub actions_applied: u32,
    pub requeue: Requeue,
}

impl ReconcileReport {
    pub fn done() -> Self {
        Self {
            actions_applied: 0,
            requeue: Requeue::Done,
        }
    }
}

/// Failures inside a pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// A conditioned write lost against a concurrent change.
    #[error("{0} changed during reconciliation")]
    Conflict(ObjectRef),

    #[error("{action} on {target} kept failing: {source}")]
    Exhausted {
        action: &'static str,
        target: ObjectRef,
        #[source]
        source: ActionError,
    },

    #[error("{action} on {target} rejected: {source}")]
    Rejected {
        action: &'static str,
        target: ObjectRef,
        #[source]
        source: ActionError,
    },
}

impl ReconcileError {
    /// True if the failure only says that `target` itself no longer exists.
    fn is_vanished(&self, target: &ObjectRef) -> bool {
        match self {
            ReconcileError::Store(StoreError::NotFound(missing))
            | ReconcileError::Rejected {
                source: ActionError::Store(StoreError::NotFound(missing)),
                ..
            } => missing == target,
            _ => false,
        }
    }
}

impl Classify for ReconcileError {
    fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) => e.class(),
            ReconcileError::Substrate(e) => e.class(),
            ReconcileError::Conflict(_) | ReconcileError::Exhausted { .. } => {
                ErrorClass::Transient
            }
            ReconcileError::Rejected { .. } => ErrorClass::Terminal,
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Actions applied during one pass.
struct Pass<'a> {
    executor: &'a ActionExecutor,
    applied: u32,
}

impl<'a> Pass<'a> {
    fn new(executor: &'a ActionExecutor) -> Self {
        Self {
            executor,
            applied: 0,
        }
    }

    /// Apply an action, mapping anything but success to an error.
    async fn apply(&mut self, action: Action) -> ReconcileResult<Option<Resource>> {
        let action_name = action.describe();
        let target = action.target();
        match self.apply_outcome(action).await {
            ActionOutcome::Applied(resource) => Ok(resource),
            ActionOutcome::Conflict => Err(ReconcileError::Conflict(target)),
            ActionOutcome::Exhausted(source) => Err(ReconcileError::Exhausted {
                action: action_name,
                target,
                source,
            }),
            ActionOutcome::Rejected(source) => Err(ReconcileError::Rejected {
                action: action_name,
                target,
                source,
            }),
        }
    }

    /// Apply an action and hand back the raw outcome.
    async fn apply_outcome(&mut self, action: Action) -> ActionOutcome {
        let outcome = self.executor.apply(action).await;
        if outcome.is_applied() {
            self.applied += 1;
        }
        outcome
    }

    fn finish(self, requeue: Requeue) -> ReconcileReport {
        ReconcileReport {
            actions_applied: self.applied,
            requeue,
        }
    }
}

/// Converges Solver, CubeState and SolveJob resources.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    index: Arc<DependencyIndex>,
    executor: Arc<ActionExecutor>,
    substrate: Arc<dyn ExecutionSubstrate>,
    settings: ReconcilerSettings,
    failures: Mutex<RetryTracker<ObjectRef>>,

    /// Per-solver locks serializing job admission, so concurrency limits
    /// hold across workers.
    admission: Mutex<HashMap<SolverKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        index: Arc<DependencyIndex>,
        executor: Arc<ActionExecutor>,
        substrate: Arc<dyn ExecutionSubstrate>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            index,
            executor,
            substrate,
            settings,
            failures: Mutex::new(RetryTracker::new(DEFAULT_RETRY_WINDOW)),
            admission: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    fn failures(&self) -> MutexGuard<'_, RetryTracker<ObjectRef>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The admission lock for jobs of `solver`. Locks nobody holds are
    /// dropped on the way.
    fn admission_lock(&self, solver: &SolverKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|key, lock| key == solver || Arc::strong_count(lock) > 1);
        locks.entry(solver.clone()).or_default().clone()
    }

    /// Run one pass for `target`.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn reconcile(&self, target: &ObjectRef) -> ReconcileReport {
        let result = match target.kind {
            ResourceKind::Solver => {
                self.reconcile_solver(&SolverKey::from_key(target.key.clone()))
                    .await
            }
            ResourceKind::CubeState => {
                self.reconcile_cube_state(&CubeStateKey::from_key(target.key.clone()))
                    .await
            }
            ResourceKind::SolveJob => {
                self.reconcile_solve_job(&SolveJobKey::from_key(target.key.clone()))
                    .await
            }
        };

        match result {
            Ok(report) => {
                self.failures().clear(target);
                debug!(
                    actions = report.actions_applied,
                    requeue = ?report.requeue,
                    "Reconciled"
                );
                report
            }
            Err(error) => self.handle_error(target, error).await,
        }
    }

    async fn handle_error(&self, target: &ObjectRef, error: ReconcileError) -> ReconcileReport {
        if error.is_vanished(target) {
            self.failures().clear(target);
            return ReconcileReport::done();
        }

        match error.class() {
            ErrorClass::Transient => {
                if matches!(error, ReconcileError::Conflict(_)) {
                    debug!(error = %error, "Conflict, reconciling again from fresh state");
                    return ReconcileReport {
                        actions_applied: 0,
                        requeue: Requeue::Immediately,
                    };
                }

                let failures = {
                    let mut tracker = self.failures();
                    tracker.prune();
                    tracker.record_failure(target)
                };
                let delay = self
                    .settings
                    .error_backoff
                    .delay(failures.saturating_sub(1));
                warn!(
                    error = %error,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Transient reconcile failure"
                );
                ReconcileReport {
                    actions_applied: 0,
                    requeue: Requeue::After(delay),
                }
            }
            ErrorClass::Terminal => {
                self.failures().clear(target);
                warn!(error = %error, "Terminal reconcile failure");
                self.surface_error(target, &error.to_string()).await;
                ReconcileReport::done()
            }
        }
    }

    /// Record a terminal failure in the resource's status. Jobs also move to a
    /// permanent `Failed`.
    async fn surface_error(&self, target: &ObjectRef, message: &str) {
        let current = match self.store.get(target).await {
            Ok(Some(resource)) => resource,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read resource to record error");
                return;
            }
        };
        let expected = current.resource_version();

        let patch = match current {
            Resource::Solver(solver) => {
                if solver.status.last_error.as_deref() == Some(message) {
                    return;
                }
                let mut status = solver.status;
                status.last_error = Some(message.to_string());
                Patch::status(status)
            }
            Resource::CubeState(cube) => {
                if cube.status.last_error.as_deref() == Some(message) {
                    return;
                }
                let mut status = cube.status;
                status.last_error = Some(message.to_string());
                Patch::status(status)
            }
            Resource::SolveJob(job) => {
                if job.status.is_terminal() {
                    return;
                }
                let mut status = job.status;
                status.phase = SolveJobPhase::Failed;
                status.last_error = Some(JobError::new(FailureReason::Rejected, message));
                status.finished_at = Some(chrono::Utc::now());
                status.next_retry_at = None;
                Patch::status(status)
            }
        };

        let outcome = self
            .executor
            .apply(Action::patch(target.clone(), expected, patch))
            .await;
        if !outcome.is_applied() {
            warn!(outcome = ?outcome, "Failed to record error in status");
        }
    }

    async fn get_solver(&self, key: &SolverKey) -> ReconcileResult<Option<Solver>> {
        Ok(self
            .store
            .get(&key.object_ref())
            .await?
            .and_then(Resource::into_solver))
    }

    async fn get_cube_state(&self, key: &CubeStateKey) -> ReconcileResult<Option<CubeState>> {
        Ok(self
            .store
            .get(&key.object_ref())
            .await?
            .and_then(Resource::into_cube_state))
    }

    async fn get_solve_job(&self, key: &SolveJobKey) -> ReconcileResult<Option<SolveJob>> {
        Ok(self
            .store
            .get(&key.object_ref())
            .await?
            .and_then(Resource::into_solve_job))
    }

    /// Children the index attributes to `solver` that still exist in the store.
    async fn live_children(&self, solver: &SolverKey) -> ReconcileResult<Vec<Resource>> {
        let mut children = Vec::new();
        for child in self.index.children_of(solver).await {
            if let Some(resource) = self.store.get(&child).await? {
                children.push(resource);
            }
        }
        Ok(children)
    }
}
