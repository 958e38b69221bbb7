//! Execution substrate interface and mock implementation.
//!
//! The substrate runs solve jobs somewhere outside the controller. The
//! controller only starts executions and polls them; it never blocks waiting
//! for one to finish.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kubesolv_id::SolveJobKey;
use kubesolv_reconcile::{Classify, ErrorClass};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::resources::ExecutionHandle;

/// Everything the substrate needs to run one attempt of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Deterministic per attempt; starting the same handle twice is a no-op.
    pub handle: ExecutionHandle,
    pub job: SolveJobKey,
    pub algorithm: String,
    pub goal: Option<String>,
    pub parameters: BTreeMap<String, String>,
    /// Snapshot of the input cube state.
    pub input: serde_json::Value,
}

/// Outcome of polling an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Running,
    Succeeded { output: serde_json::Value },
    Failed { reason: String },
}

/// Substrate errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubstrateError {
    /// The substrate has no record of the handle.
    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionHandle),

    /// The substrate refused the request.
    #[error("execution rejected: {0}")]
    Rejected(String),

    /// The substrate could not be reached.
    #[error("substrate unavailable: {0}")]
    Unavailable(String),
}

impl Classify for SubstrateError {
    fn class(&self) -> ErrorClass {
        match self {
            SubstrateError::Unavailable(_) => ErrorClass::Transient,
            SubstrateError::UnknownExecution(_) | SubstrateError::Rejected(_) => {
                ErrorClass::Terminal
            }
        }
    }
}

/// Execution substrate interface.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Start an execution and return its handle.
    async fn start_execution(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionHandle, SubstrateError>;

    /// Report the current state of an execution.
    async fn poll_status(&self, handle: &ExecutionHandle)
        -> Result<ExecutionStatus, SubstrateError>;
}

/// How the mock substrate finishes executions.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Complete successfully with the input marked solved.
    Succeed,
    /// Complete with the given failure reason.
    Fail(String),
    /// Refuse to start.
    Reject(String),
    /// Stay running until [`MockSubstrate::complete`] is called.
    Manual,
}

struct MockExecution {
    request: ExecutionRequest,
    ready_at: Instant,
    outcome: Option<ExecutionStatus>,
}

/// Mock substrate for testing and development.
pub struct MockSubstrate {
    behavior: MockBehavior,

    /// How long an execution reports `Running` before its outcome.
    run_time: Duration,

    executions: Mutex<HashMap<ExecutionHandle, MockExecution>>,

    /// Number of distinct executions started.
    starts: AtomicU64,
}

impl MockSubstrate {
    /// Create a mock substrate whose executions succeed immediately.
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::Succeed)
    }

    /// Create a mock substrate whose executions always fail.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_behavior(MockBehavior::Fail(reason.into()))
    }

    /// Create a mock substrate whose executions only finish when told to.
    pub fn manual() -> Self {
        Self::with_behavior(MockBehavior::Manual)
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            run_time: Duration::ZERO,
            executions: Mutex::new(HashMap::new()),
            starts: AtomicU64::new(0),
        }
    }

    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// Number of distinct executions started so far.
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Finish a manual execution. Returns false for unknown handles.
    pub fn complete(&self, handle: &ExecutionHandle, status: ExecutionStatus) -> bool {
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        match executions.get_mut(handle) {
            Some(execution) => {
                execution.outcome = Some(status);
                true
            }
            None => false,
        }
    }

    /// Drop all knowledge of an execution, as if the substrate lost it.
    pub fn forget(&self, handle: &ExecutionHandle) -> bool {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle)
            .is_some()
    }

    /// The request an execution was started with.
    pub fn request(&self, handle: &ExecutionHandle) -> Option<ExecutionRequest> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .map(|execution| execution.request.clone())
    }

    fn outcome_for(&self, request: &ExecutionRequest) -> Option<ExecutionStatus> {
        match &self.behavior {
            MockBehavior::Succeed => Some(ExecutionStatus::Succeeded {
                output: solved(&request.input, request.goal.as_deref()),
            }),
            MockBehavior::Fail(reason) => Some(ExecutionStatus::Failed {
                reason: reason.clone(),
            }),
            MockBehavior::Reject(_) | MockBehavior::Manual => None,
        }
    }
}

impl Default for MockSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

/// The input snapshot with the solved marker applied.
fn solved(input: &serde_json::Value, goal: Option<&str>) -> serde_json::Value {
    let mut output = match input {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("state".to_string(), other.clone());
            map
        }
    };
    output.insert("solved".to_string(), serde_json::Value::Bool(true));
    if let Some(goal) = goal {
        output.insert("goal".to_string(), serde_json::Value::from(goal));
    }
    serde_json::Value::Object(output)
}

#[async_trait]
impl ExecutionSubstrate for MockSubstrate {
    async fn start_execution(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionHandle, SubstrateError> {
        if let MockBehavior::Reject(reason) = &self.behavior {
            return Err(SubstrateError::Rejected(reason.clone()));
        }

        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = request.handle.clone();
        if executions.contains_key(&handle) {
            debug!(handle = %handle, "[MOCK] Execution already started");
            return Ok(handle);
        }

        info!(
            handle = %handle,
            job = %request.job,
            algorithm = %request.algorithm,
            "[MOCK] Starting execution"
        );

        let outcome = self.outcome_for(&request);
        executions.insert(
            handle.clone(),
            MockExecution {
                request,
                ready_at: Instant::now() + self.run_time,
                outcome,
            },
        );
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn poll_status(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionStatus, SubstrateError> {
        let executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        let execution = executions
            .get(handle)
            .ok_or_else(|| SubstrateError::UnknownExecution(handle.clone()))?;

        if Instant::now() < execution.ready_at {
            return Ok(ExecutionStatus::Running);
        }
        Ok(execution
            .outcome
            .clone()
            .unwrap_or(ExecutionStatus::Running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(handle: &str) -> ExecutionRequest {
        ExecutionRequest {
            handle: ExecutionHandle::new(handle),
            job: SolveJobKey::new("default", "j1").unwrap(),
            algorithm: "cfop".to_string(),
            goal: Some("solved".to_string()),
            parameters: BTreeMap::new(),
            input: serde_json::json!({ "faces": "RUF" }),
        }
    }

    #[tokio::test]
    async fn test_mock_substrate_succeeds() {
        let substrate = MockSubstrate::new();
        let handle = substrate.start_execution(request("h-0")).await.unwrap();

        let status = substrate.poll_status(&handle).await.unwrap();
        let ExecutionStatus::Succeeded { output } = status else {
            panic!("expected success, got {status:?}");
        };
        assert_eq!(output["faces"], "RUF");
        assert_eq!(output["solved"], true);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_handle() {
        let substrate = MockSubstrate::new();
        substrate.start_execution(request("h-0")).await.unwrap();
        substrate.start_execution(request("h-0")).await.unwrap();
        assert_eq!(substrate.starts(), 1);

        substrate.start_execution(request("h-1")).await.unwrap();
        assert_eq!(substrate.starts(), 2);
    }

    #[tokio::test]
    async fn test_manual_execution_runs_until_completed() {
        let substrate = MockSubstrate::manual();
        let handle = substrate.start_execution(request("h-0")).await.unwrap();
        assert_eq!(
            substrate.poll_status(&handle).await.unwrap(),
            ExecutionStatus::Running
        );

        let failed = ExecutionStatus::Failed {
            reason: "stuck".to_string(),
        };
        assert!(substrate.complete(&handle, failed.clone()));
        assert_eq!(substrate.poll_status(&handle).await.unwrap(), failed);
    }

    #[tokio::test]
    async fn test_forgotten_execution_is_unknown() {
        let substrate = MockSubstrate::new();
        let handle = substrate.start_execution(request("h-0")).await.unwrap();
        assert!(substrate.forget(&handle));

        let err = substrate.poll_status(&handle).await.unwrap_err();
        assert!(matches!(err, SubstrateError::UnknownExecution(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rejecting_substrate() {
        let substrate = MockSubstrate::with_behavior(MockBehavior::Reject("quota".into()));
        let err = substrate.start_execution(request("h-0")).await.unwrap_err();
        assert_eq!(err, SubstrateError::Rejected("quota".to_string()));
        assert_eq!(substrate.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_time_delays_outcome() {
        let substrate = MockSubstrate::new().with_run_time(Duration::from_secs(5));
        let handle = substrate.start_execution(request("h-0")).await.unwrap();
        assert_eq!(
            substrate.poll_status(&handle).await.unwrap(),
            ExecutionStatus::Running
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            substrate.poll_status(&handle).await.unwrap(),
            ExecutionStatus::Succeeded { .. }
        ));
    }
}
