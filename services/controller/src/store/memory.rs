//! In-memory resource store.
//!
//! Backs the binary and the tests. Writes are serialized by one lock and watch
//! events are broadcast while that lock is held, so every subscriber sees the
//! writes of a kind in commit order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use kubesolv_events::WatchEvent;
use kubesolv_id::{ObjectRef, ResourceKind, ResourceVersion, Uid};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::debug;

use super::{Patch, ResourceStore, StoreError, StoreResult, WatchStream};
use crate::resources::Resource;

/// Events buffered per kind before a slow watcher is told to relist.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectRef, Resource>,

    /// Store-wide write counter. Every write stamps the next value, so a
    /// recreated object never reuses the version of its predecessor.
    revision: u64,

    /// Number of upcoming writes that fail with `Unavailable`.
    failing_writes: u32,
}

impl Inner {
    fn next_revision(&mut self) -> ResourceVersion {
        self.revision += 1;
        ResourceVersion::new(self.revision)
    }

    fn take_injected_failure(&mut self) -> StoreResult<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// A [`ResourceStore`] held entirely in process memory.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    channels: HashMap<ResourceKind, broadcast::Sender<WatchEvent<Resource>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    pub fn with_watch_capacity(capacity: usize) -> Self {
        let channels = ResourceKind::ALL
            .into_iter()
            .map(|kind| (kind, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self {
            inner: RwLock::new(Inner::default()),
            channels,
        }
    }

    /// Makes the next `count` writes fail with a transient error.
    pub async fn inject_write_failures(&self, count: u32) {
        self.inner.write().await.failing_writes = count;
    }

    /// Removes an object without emitting a watch event, as if the event had
    /// been lost.
    pub async fn evict_silently(&self, target: &ObjectRef) -> Option<Resource> {
        self.inner.write().await.objects.remove(target)
    }

    /// Number of stored objects across all kinds.
    pub async fn len(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.objects.is_empty()
    }

    fn publish(&self, event: WatchEvent<Resource>) {
        if let Some(tx) = self.channels.get(&event.object.kind()) {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural checks the store enforces on create.
fn validate_create(resource: &Resource) -> StoreResult<()> {
    let target = resource.object_ref();
    let invalid = |reason: String| StoreError::Invalid {
        target: target.clone(),
        reason,
    };

    match (resource.kind().is_child(), resource.owner()) {
        (true, None) => return Err(invalid("missing owner reference".to_string())),
        (false, Some(_)) => return Err(invalid("solvers cannot have an owner".to_string())),
        (true, Some(owner)) if owner.solver.namespace() != target.namespace() => {
            return Err(invalid(format!(
                "owner {} is in another namespace",
                owner.solver
            )));
        }
        _ => {}
    }

    if let Resource::SolveJob(job) = resource {
        if job.spec.input.namespace() != target.namespace() {
            return Err(invalid(format!(
                "input {} is in another namespace",
                job.spec.input
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn list(&self, kind: ResourceKind) -> StoreResult<Vec<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .objects
            .iter()
            .filter(|(target, _)| target.kind == kind)
            .map(|(_, resource)| resource.clone())
            .collect())
    }

    async fn watch(&self, kind: ResourceKind) -> StoreResult<WatchStream> {
        let rx = self
            .channels
            .get(&kind)
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| StoreError::Unavailable(format!("no watch channel for {kind}")))?;

        let stream = BroadcastStream::new(rx).map(|item| match item {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Err(StoreError::WatchExpired { missed })
            }
        });
        Ok(stream.boxed())
    }

    async fn get(&self, target: &ObjectRef) -> StoreResult<Option<Resource>> {
        Ok(self.inner.read().await.objects.get(target).cloned())
    }

    async fn create(&self, mut resource: Resource) -> StoreResult<Resource> {
        validate_create(&resource)?;
        let target = resource.object_ref();

        let mut inner = self.inner.write().await;
        inner.take_injected_failure()?;
        if inner.objects.contains_key(&target) {
            return Err(StoreError::AlreadyExists(target));
        }

        let revision = inner.next_revision();
        let meta = resource.metadata_mut();
        meta.uid = Some(Uid::new());
        meta.resource_version = revision;
        meta.generation = 1;
        meta.created_at = Some(Utc::now());
        meta.deletion_requested_at = None;

        inner.objects.insert(target.clone(), resource.clone());
        debug!(target = %target, "Created resource");
        self.publish(WatchEvent::created(resource.clone()));
        Ok(resource)
    }

    async fn patch(
        &self,
        target: &ObjectRef,
        expected: ResourceVersion,
        patch: Patch,
    ) -> StoreResult<Resource> {
        let mut inner = self.inner.write().await;
        inner.take_injected_failure()?;

        let current = inner
            .objects
            .get(target)
            .ok_or_else(|| StoreError::NotFound(target.clone()))?;
        let actual = current.resource_version();
        if actual != expected {
            return Err(StoreError::VersionConflict {
                target: target.clone(),
                expected,
                actual,
            });
        }

        let mut updated = current.clone();
        let changed = patch
            .apply_to(&mut updated)
            .map_err(|reason| StoreError::Invalid {
                target: target.clone(),
                reason,
            })?;
        if !changed {
            return Ok(updated);
        }

        let revision = inner.next_revision();
        let meta = updated.metadata_mut();
        meta.resource_version = revision;

        if meta.is_deletion_requested() && meta.finalizers.is_empty() {
            inner.objects.remove(target);
            debug!(target = %target, "Finalized resource");
            self.publish(WatchEvent::deleted(updated.clone()));
        } else {
            inner.objects.insert(target.clone(), updated.clone());
            self.publish(WatchEvent::updated(updated.clone()));
        }
        Ok(updated)
    }

    async fn delete(
        &self,
        target: &ObjectRef,
        expected: Option<ResourceVersion>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.take_injected_failure()?;

        let current = inner
            .objects
            .get(target)
            .ok_or_else(|| StoreError::NotFound(target.clone()))?;
        let actual = current.resource_version();
        if let Some(expected) = expected.filter(|expected| *expected != actual) {
            return Err(StoreError::VersionConflict {
                target: target.clone(),
                expected,
                actual,
            });
        }
        let has_finalizers = !current.metadata().finalizers.is_empty();
        let already_requested = current.metadata().is_deletion_requested();

        if !has_finalizers {
            if let Some(removed) = inner.objects.remove(target) {
                debug!(target = %target, "Deleted resource");
                self.publish(WatchEvent::deleted(removed));
            }
            return Ok(());
        }
        if already_requested {
            return Ok(());
        }

        let revision = inner.next_revision();
        if let Some(current) = inner.objects.get_mut(target) {
            let meta = current.metadata_mut();
            meta.deletion_requested_at = Some(Utc::now());
            meta.resource_version = revision;
            debug!(target = %target, "Marked resource for deletion");
            self.publish(WatchEvent::updated(current.clone()));
        }
        Ok(())
    }
}
