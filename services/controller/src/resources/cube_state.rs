use kubesolv_id::CubeStateKey;
use serde::{Deserialize, Serialize};

use super::{ExecutionHandle, ObjectMeta, OwnerReference};

/// Lifecycle phase of a cube state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CubeStatePhase {
    #[default]
    Initializing,
    Ready,
    Stale,
    Deleted,
}

impl CubeStatePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CubeStatePhase::Initializing => "Initializing",
            CubeStatePhase::Ready => "Ready",
            CubeStatePhase::Stale => "Stale",
            CubeStatePhase::Deleted => "Deleted",
        }
    }

    /// Stale and Deleted cube states are never revived by the controller.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CubeStatePhase::Stale | CubeStatePhase::Deleted)
    }
}

impl std::fmt::Display for CubeStatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeStateSpec {
    /// Opaque puzzle snapshot.
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeStateStatus {
    #[serde(default)]
    pub phase: CubeStatePhase,

    /// Incremented whenever the snapshot changes after the cube became Ready.
    #[serde(default)]
    pub revision: u64,

    /// Digest of the snapshot the status was last computed from.
    #[serde(default)]
    pub snapshot_digest: Option<String>,

    /// Execution that last wrote a solution into the snapshot.
    #[serde(default)]
    pub last_writer: Option<ExecutionHandle>,

    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeState {
    pub metadata: ObjectMeta,
    pub spec: CubeStateSpec,
    #[serde(default)]
    pub status: CubeStateStatus,
}

impl CubeState {
    pub fn new(key: CubeStateKey, owner: OwnerReference, snapshot: serde_json::Value) -> Self {
        Self {
            metadata: ObjectMeta::owned_by(key.into(), owner),
            spec: CubeStateSpec { snapshot },
            status: CubeStateStatus::default(),
        }
    }

    pub fn key(&self) -> CubeStateKey {
        CubeStateKey::from_key(self.metadata.key.clone())
    }
}
