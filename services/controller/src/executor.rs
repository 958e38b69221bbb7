//! Action executor.
//!
//! Applies the actions a reconciler decided on. Transient failures are
//! retried with capped exponential backoff up to a bounded number of
//! attempts. A version conflict is never retried blindly: it goes back to the
//! reconciler, which re-reads current state and decides again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kubesolv_id::{ObjectRef, ResourceVersion};
use kubesolv_reconcile::{BackoffPolicy, Classify, ErrorClass};
use thiserror::Error;
use tracing::{debug, warn};

use crate::resources::Resource;
use crate::store::{Patch, ResourceStore, StoreError};
use crate::substrate::{ExecutionRequest, ExecutionSubstrate, SubstrateError};

/// One corrective step.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create a child resource.
    Create(Resource),

    /// Patch a resource that was observed at `expected`.
    Patch {
        target: ObjectRef,
        expected: ResourceVersion,
        patch: Patch,
    },

    /// Delete a resource that was observed at `expected`.
    Delete {
        target: ObjectRef,
        expected: ResourceVersion,
    },

    /// Hand a job attempt to the execution substrate.
    StartExecution(ExecutionRequest),
}

impl Action {
    pub fn patch(target: ObjectRef, expected: ResourceVersion, patch: Patch) -> Self {
        Action::Patch {
            target,
            expected,
            patch,
        }
    }

    pub fn delete(target: ObjectRef, expected: ResourceVersion) -> Self {
        Action::Delete { target, expected }
    }

    /// Short label for logs.
    pub fn describe(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Patch { .. } => "patch",
            Action::Delete { .. } => "delete",
            Action::StartExecution(_) => "start_execution",
        }
    }

    /// The resource the action concerns. For an execution start, the job.
    pub fn target(&self) -> ObjectRef {
        match self {
            Action::Create(resource) => resource.object_ref(),
            Action::Patch { target, .. } | Action::Delete { target, .. } => target.clone(),
            Action::StartExecution(request) => request.job.object_ref(),
        }
    }
}

/// Failure of a single action attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

impl Classify for ActionError {
    fn class(&self) -> ErrorClass {
        match self {
            ActionError::Store(e) => e.class(),
            ActionError::Substrate(e) => e.class(),
        }
    }
}

/// Result of applying an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The write took effect. Carries the resource as stored after a create
    /// or patch.
    Applied(Option<Resource>),

    /// The target changed since it was read; reconcile again from fresh state.
    Conflict,

    /// A transient failure outlived the retry budget.
    Exhausted(ActionError),

    /// A non-transient failure; never retried.
    Rejected(ActionError),
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied(_))
    }
}

/// Retry settings for store and substrate writes.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(2))
                .with_jitter(0.2),
        }
    }
}

/// Counters kept by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub applied: u64,
    pub retries: u64,
    pub conflicts: u64,
    pub exhausted: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    retries: AtomicU64,
    conflicts: AtomicU64,
    exhausted: AtomicU64,
    rejected: AtomicU64,
}

/// Applies actions against the store and the substrate.
pub struct ActionExecutor {
    store: Arc<dyn ResourceStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
    policy: WritePolicy,
    counters: Counters,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        policy: WritePolicy,
    ) -> Self {
        Self {
            store,
            substrate,
            policy,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Apply `action`, retrying transient failures.
    pub async fn apply(&self, action: Action) -> ActionOutcome {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match self.try_apply(&action).await {
                Ok(resource) => {
                    self.counters.applied.fetch_add(1, Ordering::Relaxed);
                    debug!(action = action.describe(), target = %action.target(), "Applied action");
                    return ActionOutcome::Applied(resource);
                }
                Err(error) => error,
            };

            match (&action, &error) {
                (_, ActionError::Store(e)) if e.is_conflict() => {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(action = action.describe(), error = %error, "Version conflict");
                    return ActionOutcome::Conflict;
                }
                // Someone else already did it.
                (Action::Create(_), ActionError::Store(StoreError::AlreadyExists(_))) => {
                    self.counters.applied.fetch_add(1, Ordering::Relaxed);
                    return ActionOutcome::Applied(None);
                }
                (Action::Delete { .. }, ActionError::Store(e)) if e.is_not_found() => {
                    self.counters.applied.fetch_add(1, Ordering::Relaxed);
                    return ActionOutcome::Applied(None);
                }
                _ => {}
            }

            if !error.is_transient() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(action = action.describe(), error = %error, "Action rejected");
                return ActionOutcome::Rejected(error);
            }

            if attempt >= self.policy.max_attempts {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    action = action.describe(),
                    attempts = attempt,
                    error = %error,
                    "Action retries exhausted"
                );
                return ActionOutcome::Exhausted(error);
            }

            let delay = self.policy.backoff.delay_with_jitter(attempt - 1);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                action = action.describe(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_apply(&self, action: &Action) -> Result<Option<Resource>, ActionError> {
        match action {
            Action::Create(resource) => Ok(Some(self.store.create(resource.clone()).await?)),
            Action::Patch {
                target,
                expected,
                patch,
            } => Ok(Some(
                self.store.patch(target, *expected, patch.clone()).await?,
            )),
            Action::Delete { target, expected } => {
                self.store.delete(target, Some(*expected)).await?;
                Ok(None)
            }
            Action::StartExecution(request) => {
                self.substrate.start_execution(request.clone()).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kubesolv_id::SolverKey;

    use super::*;
    use crate::resources::{Solver, SolverSpec, SolverStatus, SolverPhase};
    use crate::store::InMemoryStore;
    use crate::substrate::MockSubstrate;

    fn executor(store: Arc<InMemoryStore>, max_attempts: u32) -> ActionExecutor {
        ActionExecutor::new(
            store,
            Arc::new(MockSubstrate::new()),
            WritePolicy {
                max_attempts,
                backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4)),
            },
        )
    }

    fn solver() -> Resource {
        Solver::new(
            SolverKey::new("default", "s1").unwrap(),
            SolverSpec::new("cfop"),
        )
        .into()
    }

    fn active() -> Patch {
        Patch::status(SolverStatus {
            phase: SolverPhase::Active,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store.clone(), 5);
        store.inject_write_failures(2).await;

        let outcome = executor.apply(Action::Create(solver())).await;
        assert!(outcome.is_applied());
        assert_eq!(executor.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store.clone(), 3);
        store.inject_write_failures(10).await;

        let outcome = executor.apply(Action::Create(solver())).await;
        assert!(matches!(outcome, ActionOutcome::Exhausted(_)));
        assert_eq!(executor.stats().retries, 2);
        assert_eq!(executor.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn test_conflict_is_returned_without_retry() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store.clone(), 5);
        let created = store.create(solver()).await.unwrap();
        let target = created.object_ref();
        store
            .patch(&target, created.resource_version(), active())
            .await
            .unwrap();

        let outcome = executor
            .apply(Action::patch(
                target,
                created.resource_version(),
                Patch::default().adding_finalizer("x"),
            ))
            .await;
        assert_eq!(outcome, ActionOutcome::Conflict);
        assert_eq!(executor.stats().retries, 0);
    }

    #[tokio::test]
    async fn test_not_found_patch_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store, 5);
        let outcome = executor
            .apply(Action::patch(
                solver().object_ref(),
                ResourceVersion::FIRST,
                active(),
            ))
            .await;
        let ActionOutcome::Rejected(error) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn test_create_and_delete_are_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store.clone(), 5);

        let ActionOutcome::Applied(Some(created)) = executor.apply(Action::Create(solver())).await
        else {
            panic!("expected the first create to apply");
        };
        assert!(executor.apply(Action::Create(solver())).await.is_applied());

        let target = created.object_ref();
        let version = created.resource_version();
        assert!(executor.apply(Action::delete(target.clone(), version)).await.is_applied());
        assert!(executor.apply(Action::delete(target, version)).await.is_applied());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_of_changed_object_conflicts() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store.clone(), 5);
        let created = store.create(solver()).await.unwrap();
        let target = created.object_ref();
        store
            .patch(&target, created.resource_version(), active())
            .await
            .unwrap();

        let outcome = executor
            .apply(Action::delete(target.clone(), created.resource_version()))
            .await;
        assert_eq!(outcome, ActionOutcome::Conflict);
        assert!(store.get(&target).await.unwrap().is_some());
    }
}
