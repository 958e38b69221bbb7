use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kubesolv_id::{CubeStateKey, SolveJobKey, Uid};
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, OwnerReference};

/// Lifecycle phase of a solve job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveJobPhase {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl SolveJobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolveJobPhase::Queued => "Queued",
            SolveJobPhase::Running => "Running",
            SolveJobPhase::Succeeded => "Succeeded",
            SolveJobPhase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SolveJobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The owning solver or the input cube state no longer exists.
    OrphanedReference,
    /// The input cube state belongs to a different solver.
    InvalidReference,
    /// The input cube state changed while the job was running.
    Conflict,
    ExecutionFailed,
    /// The substrate no longer knows the execution handle.
    ExecutionLost,
    /// The substrate refused to start the execution.
    StartRejected,
    /// The store refused one of the job's writes.
    Rejected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::OrphanedReference => "OrphanedReference",
            FailureReason::InvalidReference => "InvalidReference",
            FailureReason::Conflict => "Conflict",
            FailureReason::ExecutionFailed => "ExecutionFailed",
            FailureReason::ExecutionLost => "ExecutionLost",
            FailureReason::StartRejected => "StartRejected",
            FailureReason::Rejected => "Rejected",
        }
    }

    /// Retryable failures re-enter `Queued` while the retry budget lasts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::Conflict | FailureReason::ExecutionFailed | FailureReason::ExecutionLost
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-error summary surfaced in a job's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub reason: FailureReason,
    pub message: String,
}

impl JobError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Opaque handle naming one execution attempt in the substrate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Deterministic handle for attempt `attempt` of a job, so that restarting
    /// the same attempt lands on the same execution.
    pub fn for_attempt(job_uid: Option<Uid>, job: &SolveJobKey, attempt: u32) -> Self {
        match job_uid {
            Some(uid) => Self(format!("{uid}-{attempt}")),
            None => Self(format!("{}.{}-{attempt}", job.namespace(), job.name())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveJobSpec {
    pub input: CubeStateKey,

    /// Overrides the solver's goal when set.
    #[serde(default)]
    pub goal: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveJobStatus {
    #[serde(default)]
    pub phase: SolveJobPhase,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub last_error: Option<JobError>,

    #[serde(default)]
    pub execution: Option<ExecutionHandle>,

    /// Resource version of the input cube state read when execution started.
    #[serde(default)]
    pub input_version: Option<kubesolv_id::ResourceVersion>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Set on a failed job that will be retried.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl SolveJobStatus {
    /// True once the job will never be touched again by the controller.
    pub fn is_terminal(&self) -> bool {
        match self.phase {
            SolveJobPhase::Succeeded => true,
            SolveJobPhase::Failed => self.next_retry_at.is_none(),
            SolveJobPhase::Queued | SolveJobPhase::Running => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == SolveJobPhase::Running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveJob {
    pub metadata: ObjectMeta,
    pub spec: SolveJobSpec,
    #[serde(default)]
    pub status: SolveJobStatus,
}

impl SolveJob {
    pub fn new(key: SolveJobKey, owner: OwnerReference, input: CubeStateKey) -> Self {
        Self {
            metadata: ObjectMeta::owned_by(key.into(), owner),
            spec: SolveJobSpec {
                input,
                goal: None,
                parameters: BTreeMap::new(),
            },
            status: SolveJobStatus::default(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.spec.goal = Some(goal.into());
        self
    }

    pub fn key(&self) -> SolveJobKey {
        SolveJobKey::from_key(self.metadata.key.clone())
    }

    /// Handle for the current attempt.
    pub fn execution_handle(&self) -> ExecutionHandle {
        ExecutionHandle::for_attempt(self.metadata.uid, &self.key(), self.status.retry_count)
    }
}
