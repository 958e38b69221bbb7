//! Resource Store Client.
//!
//! The store is the authoritative record of every managed resource. The
//! controller reads it, watches it, and writes to it only through
//! version-conditioned calls; it never caches writes locally.

mod memory;

pub use memory::{InMemoryStore, DEFAULT_WATCH_CAPACITY};

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use kubesolv_events::WatchEvent;
use kubesolv_id::{ObjectRef, ResourceKind, ResourceVersion};
use kubesolv_reconcile::{Classify, ErrorClass};
use thiserror::Error;

use crate::resources::{Resource, ResourceSpec, ResourceStatus};

/// Resource store errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The target does not exist.
    #[error("{0} not found")]
    NotFound(ObjectRef),

    /// A resource with the same identity already exists.
    #[error("{0} already exists")]
    AlreadyExists(ObjectRef),

    /// The resource changed since the caller read it.
    #[error("version conflict on {target}: expected {expected}, found {actual}")]
    VersionConflict {
        target: ObjectRef,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    /// The store rejected the write.
    #[error("invalid write to {target}: {reason}")]
    Invalid { target: ObjectRef, reason: String },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish in time.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The watch fell behind and events were dropped; the caller must relist.
    #[error("watch expired after missing {missed} events")]
    WatchExpired { missed: u64 },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::VersionConflict { .. }
            | StoreError::Unavailable(_)
            | StoreError::Timeout(_)
            | StoreError::WatchExpired { .. } => ErrorClass::Transient,
            StoreError::NotFound(_) | StoreError::AlreadyExists(_) | StoreError::Invalid { .. } => {
                ErrorClass::Terminal
            }
        }
    }
}

/// Result type for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// A partial update: replace spec and/or status, add or drop finalizers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub spec: Option<ResourceSpec>,
    pub status: Option<ResourceStatus>,
    pub add_finalizers: Vec<String>,
    pub remove_finalizers: Vec<String>,
}

impl Patch {
    /// A patch that replaces the status only.
    pub fn status(status: impl Into<ResourceStatus>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    /// A patch that replaces the spec only.
    pub fn spec(spec: impl Into<ResourceSpec>) -> Self {
        Self {
            spec: Some(spec.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<ResourceStatus>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn adding_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.add_finalizers.push(finalizer.into());
        self
    }

    pub fn removing_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.remove_finalizers.push(finalizer.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.spec.is_none()
            && self.status.is_none()
            && self.add_finalizers.is_empty()
            && self.remove_finalizers.is_empty()
    }

    /// Applies the patch to `resource` in place.
    ///
    /// Returns whether anything changed. A spec change bumps `generation`;
    /// bumping `resource_version` is left to the store.
    pub fn apply_to(&self, resource: &mut Resource) -> Result<bool, String> {
        let before = resource.clone();

        if let Some(spec) = &self.spec {
            let spec_changed = match (&mut *resource, spec) {
                (Resource::Solver(r), ResourceSpec::Solver(s)) => replace(&mut r.spec, s),
                (Resource::CubeState(r), ResourceSpec::CubeState(s)) => replace(&mut r.spec, s),
                (Resource::SolveJob(r), ResourceSpec::SolveJob(s)) => replace(&mut r.spec, s),
                (r, _) => return Err(format!("spec kind does not match {}", r.kind())),
            };
            if spec_changed {
                resource.metadata_mut().generation += 1;
            }
        }

        if let Some(status) = &self.status {
            match (&mut *resource, status) {
                (Resource::Solver(r), ResourceStatus::Solver(s)) => replace(&mut r.status, s),
                (Resource::CubeState(r), ResourceStatus::CubeState(s)) => {
                    replace(&mut r.status, s)
                }
                (Resource::SolveJob(r), ResourceStatus::SolveJob(s)) => replace(&mut r.status, s),
                (r, _) => return Err(format!("status kind does not match {}", r.kind())),
            };
        }

        let meta = resource.metadata_mut();
        for finalizer in &self.add_finalizers {
            if !meta.has_finalizer(finalizer) {
                meta.finalizers.push(finalizer.clone());
            }
        }
        meta.finalizers
            .retain(|f| !self.remove_finalizers.iter().any(|r| r == f));

        Ok(*resource != before)
    }
}

fn replace<T: Clone + PartialEq>(slot: &mut T, value: &T) -> bool {
    if slot == value {
        return false;
    }
    *slot = value.clone();
    true
}

macro_rules! impl_into_patch_part {
    ($part:ident, $variant:ident, $ty:ty) => {
        impl From<$ty> for $part {
            fn from(value: $ty) -> Self {
                $part::$variant(value)
            }
        }
    };
}

impl_into_patch_part!(ResourceSpec, Solver, crate::resources::SolverSpec);
impl_into_patch_part!(ResourceSpec, CubeState, crate::resources::CubeStateSpec);
impl_into_patch_part!(ResourceSpec, SolveJob, crate::resources::SolveJobSpec);
impl_into_patch_part!(ResourceStatus, Solver, crate::resources::SolverStatus);
impl_into_patch_part!(ResourceStatus, CubeState, crate::resources::CubeStateStatus);
impl_into_patch_part!(ResourceStatus, SolveJob, crate::resources::SolveJobStatus);

/// Stream of watch events for one kind.
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent<Resource>>>;

/// Access to the authoritative resource store.
///
/// Every write is conditioned on a resource version the caller observed, so a
/// concurrent edit surfaces as [`StoreError::VersionConflict`] instead of being
/// overwritten.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Lists every resource of `kind`.
    async fn list(&self, kind: ResourceKind) -> StoreResult<Vec<Resource>>;

    /// Opens a change stream for `kind`.
    ///
    /// Events that happen after this call returns are delivered in order. A
    /// `WatchExpired` item means events were lost and the caller must relist.
    async fn watch(&self, kind: ResourceKind) -> StoreResult<WatchStream>;

    /// Reads one resource; `Ok(None)` when it does not exist.
    async fn get(&self, target: &ObjectRef) -> StoreResult<Option<Resource>>;

    /// Creates a resource. The store assigns uid, version and timestamps.
    async fn create(&self, resource: Resource) -> StoreResult<Resource>;

    /// Applies `patch` if the resource is still at `expected`.
    async fn patch(
        &self,
        target: &ObjectRef,
        expected: ResourceVersion,
        patch: Patch,
    ) -> StoreResult<Resource>;

    /// Requests deletion, optionally conditioned on `expected`.
    ///
    /// An object carrying finalizers is only marked for deletion; it is removed
    /// once its last finalizer is dropped.
    async fn delete(&self, target: &ObjectRef, expected: Option<ResourceVersion>)
        -> StoreResult<()>;
}
