//! # kubesolv-events
//!
//! Change events observed on the resource store, and the triggers that turn
//! them into reconciliation requests.
//!
//! ## Design Principles
//!
//! - A watch event carries the full object as observed, never a diff
//! - Events are hints: reconciliation always re-reads current state, so a
//!   dropped or duplicated event is harmless
//! - Deleted events carry the last observed object so owners can be resolved
//!
//! ## Triggers
//!
//! Every enqueue records why it happened ([`Trigger`]), which is only used for
//! logging and queue statistics; the reconciler never branches on it.

mod trigger;
mod watch;

pub use trigger::Trigger;
pub use watch::{WatchEvent, WatchEventKind};
