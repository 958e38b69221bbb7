use std::collections::BTreeMap;

use kubesolv_id::{CubeStateKey, IdError, SolverKey};
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, OwnerReference};

/// Lifecycle phase of a solver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverPhase {
    #[default]
    Pending,
    Active,
    Terminating,
}

impl SolverPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverPhase::Pending => "Pending",
            SolverPhase::Active => "Active",
            SolverPhase::Terminating => "Terminating",
        }
    }
}

impl std::fmt::Display for SolverPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired configuration of a solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverSpec {
    pub algorithm: String,

    /// Maximum number of jobs running at once; 0 means unlimited.
    #[serde(default)]
    pub concurrency_limit: u32,

    /// Default goal handed to jobs that do not name one.
    #[serde(default)]
    pub goal: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// When set, the controller creates a seed cube state holding this snapshot.
    #[serde(default)]
    pub initial_state: Option<serde_json::Value>,
}

impl SolverSpec {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            concurrency_limit: 0,
            goal: None,
            parameters: BTreeMap::new(),
            initial_state: None,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_initial_state(mut self, snapshot: serde_json::Value) -> Self {
        self.initial_state = Some(snapshot);
        self
    }
}

/// Observed state of a solver, written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverStatus {
    #[serde(default)]
    pub phase: SolverPhase,

    #[serde(default)]
    pub observed_generation: u64,

    #[serde(default)]
    pub cube_states: u32,

    #[serde(default)]
    pub solve_jobs: u32,

    #[serde(default)]
    pub running_jobs: u32,

    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solver {
    pub metadata: ObjectMeta,
    pub spec: SolverSpec,
    #[serde(default)]
    pub status: SolverStatus,
}

impl Solver {
    pub fn new(key: SolverKey, spec: SolverSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(key.into()),
            spec,
            status: SolverStatus::default(),
        }
    }

    pub fn key(&self) -> SolverKey {
        SolverKey::from_key(self.metadata.key.clone())
    }

    /// Owner reference children should carry, pinned to this solver's UID.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            solver: self.key(),
            uid: self.metadata.uid,
        }
    }

    /// Key of the cube state seeded from `spec.initial_state`.
    pub fn seed_cube_key(&self) -> Result<CubeStateKey, IdError> {
        CubeStateKey::new(
            self.metadata.key.namespace(),
            format!("{}-seed", self.metadata.key.name()),
        )
    }
}
