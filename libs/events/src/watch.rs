//! Watch event envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchEventKind::Created => "created",
            WatchEventKind::Updated => "updated",
            WatchEventKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One change observed on a watched kind.
///
/// For `Deleted` events `object` is the last state the store held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent<R> {
    /// The kind of change.
    pub kind: WatchEventKind,

    /// The object after the change (before it, for deletions).
    pub object: R,

    /// When the store emitted the event.
    pub observed_at: DateTime<Utc>,
}

impl<R> WatchEvent<R> {
    /// Create an event stamped with the current time.
    pub fn new(kind: WatchEventKind, object: R) -> Self {
        Self {
            kind,
            object,
            observed_at: Utc::now(),
        }
    }

    pub fn created(object: R) -> Self {
        Self::new(WatchEventKind::Created, object)
    }

    pub fn updated(object: R) -> Self {
        Self::new(WatchEventKind::Updated, object)
    }

    pub fn deleted(object: R) -> Self {
        Self::new(WatchEventKind::Deleted, object)
    }

    /// Returns true if the object is gone from the store.
    pub fn is_deletion(&self) -> bool {
        self.kind == WatchEventKind::Deleted
    }

    /// Transform the carried object, keeping kind and timestamp.
    pub fn map<T, F>(self, f: F) -> WatchEvent<T>
    where
        F: FnOnce(R) -> T,
    {
        WatchEvent {
            kind: self.kind,
            object: f(self.object),
            observed_at: self.observed_at,
        }
    }
}
