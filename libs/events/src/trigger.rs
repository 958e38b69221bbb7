//! Reasons an identity gets enqueued for reconciliation.

use serde::{Deserialize, Serialize};

use crate::WatchEventKind;

/// Why a reconciliation request was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The identity itself changed.
    Watch(WatchEventKind),

    /// A child of this solver changed.
    Child,

    /// A resource this one depends on (or that depends on it) changed.
    Dependency,

    /// The owner was removed and this child lost its parent.
    OwnerRemoved,

    /// Periodic or post-gap relist.
    Resync,

    /// The previous pass asked to be run again.
    Requeue,
}

impl Trigger {
    /// Stable label for logs and stats.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Trigger::Watch(WatchEventKind::Created) => "created",
            Trigger::Watch(WatchEventKind::Updated) => "updated",
            Trigger::Watch(WatchEventKind::Deleted) => "deleted",
            Trigger::Child => "child",
            Trigger::Dependency => "dependency",
            Trigger::OwnerRemoved => "owner_removed",
            Trigger::Resync => "resync",
            Trigger::Requeue => "requeue",
        }
    }
}

impl From<WatchEventKind> for Trigger {
    fn from(kind: WatchEventKind) -> Self {
        Trigger::Watch(kind)
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
