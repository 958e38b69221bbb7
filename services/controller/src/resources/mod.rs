//! Resource model for the three managed kinds.
//!
//! A `Solver` owns any number of `CubeState` and `SolveJob` children. Children
//! point back at their owner through an [`OwnerReference`] stored in their
//! metadata; the hierarchy is strictly a tree of depth one.

mod cube_state;
mod solve_job;
mod solver;

pub use cube_state::{CubeState, CubeStatePhase, CubeStateSpec, CubeStateStatus};
pub use solve_job::{
    ExecutionHandle, FailureReason, JobError, SolveJob, SolveJobPhase, SolveJobSpec,
    SolveJobStatus,
};
pub use solver::{Solver, SolverPhase, SolverSpec, SolverStatus};

use chrono::{DateTime, Utc};
use kubesolv_id::{ObjectKey, ObjectRef, ResourceKind, ResourceVersion, SolverKey, Uid};
use serde::{Deserialize, Serialize};

/// Finalizer the controller places on live solvers so deletion drains children first.
pub const CASCADE_FINALIZER: &str = "kubesolv.io/cascade";

/// Non-owning back-reference from a child to its solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub solver: SolverKey,

    /// UID of the solver when the reference was written. `None` matches any
    /// solver with the right key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
}

impl OwnerReference {
    pub fn new(solver: SolverKey) -> Self {
        Self { solver, uid: None }
    }

    pub fn with_uid(solver: SolverKey, uid: Uid) -> Self {
        Self {
            solver,
            uid: Some(uid),
        }
    }

    /// Returns true if `solver` is the live object this reference points at.
    ///
    /// A solver deleted and recreated under the same key does not satisfy a
    /// reference that recorded the old UID.
    pub fn is_satisfied_by(&self, solver: &Solver) -> bool {
        solver.key() == self.solver
            && self
                .uid
                .is_none_or(|uid| solver.metadata.uid == Some(uid))
    }
}

fn first_generation() -> u64 {
    1
}

/// Metadata common to every resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub key: ObjectKey,

    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: Option<Uid>,

    /// Bumped on every write; the optimistic-concurrency token.
    #[serde(default)]
    pub resource_version: ResourceVersion,

    /// Bumped only when the spec changes.
    #[serde(default = "first_generation")]
    pub generation: u64,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// Set when deletion was requested while finalizers were still present.
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finalizers: Vec<String>,

    #[serde(default)]
    pub owner: Option<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            uid: None,
            resource_version: ResourceVersion::default(),
            generation: first_generation(),
            created_at: None,
            deletion_requested_at: None,
            finalizers: Vec::new(),
            owner: None,
        }
    }

    pub fn owned_by(key: ObjectKey, owner: OwnerReference) -> Self {
        Self {
            owner: Some(owner),
            ..Self::new(key)
        }
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Any managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Resource {
    Solver(Solver),
    CubeState(CubeState),
    SolveJob(SolveJob),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Solver(_) => ResourceKind::Solver,
            Resource::CubeState(_) => ResourceKind::CubeState,
            Resource::SolveJob(_) => ResourceKind::SolveJob,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::Solver(r) => &r.metadata,
            Resource::CubeState(r) => &r.metadata,
            Resource::SolveJob(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Resource::Solver(r) => &mut r.metadata,
            Resource::CubeState(r) => &mut r.metadata,
            Resource::SolveJob(r) => &mut r.metadata,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.metadata().key.clone())
    }

    pub fn owner(&self) -> Option<&OwnerReference> {
        self.metadata().owner.as_ref()
    }

    pub fn resource_version(&self) -> ResourceVersion {
        self.metadata().resource_version
    }

    pub fn into_solver(self) -> Option<Solver> {
        match self {
            Resource::Solver(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_cube_state(self) -> Option<CubeState> {
        match self {
            Resource::CubeState(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_solve_job(self) -> Option<SolveJob> {
        match self {
            Resource::SolveJob(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_solve_job(&self) -> Option<&SolveJob> {
        match self {
            Resource::SolveJob(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Solver> for Resource {
    fn from(r: Solver) -> Self {
        Resource::Solver(r)
    }
}

impl From<CubeState> for Resource {
    fn from(r: CubeState) -> Self {
        Resource::CubeState(r)
    }
}

impl From<SolveJob> for Resource {
    fn from(r: SolveJob) -> Self {
        Resource::SolveJob(r)
    }
}

/// A replacement spec for one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Solver(SolverSpec),
    CubeState(CubeStateSpec),
    SolveJob(SolveJobSpec),
}

/// A replacement status for one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceStatus {
    Solver(SolverStatus),
    CubeState(CubeStateStatus),
    SolveJob(SolveJobStatus),
}
